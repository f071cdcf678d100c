use std::fmt::{Debug, Display, Formatter};

use bitflags::bitflags;

use crate::channel::error::ChannelError;

bitflags! {
    /// The four independently startable services of a channel. Start / stop calls accept any
    ///  combination.
    #[derive(Copy, Clone, Eq, PartialEq, Hash)]
    pub struct ServiceSet: u32 {
        /// the replication receiver, accepting messages from other members
        const SND_RX_SEQ = 1;
        /// the replication sender
        const SND_TX_SEQ = 2;
        /// the membership listener, learning about other members
        const MBR_RX_SEQ = 4;
        /// the membership broadcaster, announcing the local member. It must not be started
        ///  before the receiver because the broadcast contains the receiver's bound port
        const MBR_TX_SEQ = 8;
    }
}

impl ServiceSet {
    pub const DEFAULT: ServiceSet = ServiceSet::all();

    /// individual services in the order in which they are started
    pub const START_ORDER: [ServiceSet; 4] = [ServiceSet::SND_RX_SEQ, ServiceSet::SND_TX_SEQ, ServiceSet::MBR_RX_SEQ, ServiceSet::MBR_TX_SEQ];

    pub fn from_raw(raw: u32) -> Result<ServiceSet, ChannelError> {
        ServiceSet::from_bits(raw)
            .ok_or_else(|| ChannelError::Config(format!("invalid service mask 0x{:x}", raw)))
    }

    fn index(self) -> usize {
        self.bits().trailing_zeros() as usize
    }

    fn name(self) -> &'static str {
        match self {
            ServiceSet::SND_RX_SEQ => "SND_RX_SEQ",
            ServiceSet::SND_TX_SEQ => "SND_TX_SEQ",
            ServiceSet::MBR_RX_SEQ => "MBR_RX_SEQ",
            ServiceSet::MBR_TX_SEQ => "MBR_TX_SEQ",
            _ => "?",
        }
    }
}

impl Debug for ServiceSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for ServiceSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = ServiceSet::START_ORDER.iter()
            .filter(|s| self.contains(**s))
            .map(|s| s.name())
            .collect::<Vec<_>>();
        write!(f, "[{}]", names.join("|"))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Tracks the lifecycle of each of the four services: `Stopped -> Starting -> Running ->
///  Stopping -> Stopped`.
#[derive(Debug)]
pub struct ServiceStates {
    states: [ServiceState; 4],
}

impl Default for ServiceStates {
    fn default() -> Self {
        ServiceStates {
            states: [ServiceState::Stopped; 4],
        }
    }
}

impl ServiceStates {
    pub fn state(&self, service: ServiceSet) -> ServiceState {
        self.states[service.index()]
    }

    pub fn is_running(&self, service: ServiceSet) -> bool {
        self.state(service) == ServiceState::Running
    }

    pub fn running(&self) -> ServiceSet {
        ServiceSet::START_ORDER.iter()
            .filter(|s| self.is_running(**s))
            .fold(ServiceSet::empty(), |acc, s| acc | *s)
    }

    /// Moves all requested services to `Starting`, returning them in start order. Nothing is
    ///  changed if any of them is not currently stopped.
    pub fn begin_start(&mut self, requested: ServiceSet) -> Result<Vec<ServiceSet>, ChannelError> {
        let services = Self::individual(requested)?;
        if let Some(s) = services.iter().find(|s| self.state(**s) != ServiceState::Stopped) {
            return Err(ChannelError::IllegalState(format!("service {} is already started ({:?})", s, self.state(*s))));
        }
        for s in &services {
            self.states[s.index()] = ServiceState::Starting;
        }
        Ok(services)
    }

    /// Moves all requested services to `Stopping`, returning them in stop order (reverse start
    ///  order). Nothing is changed if any of them is not currently running.
    pub fn begin_stop(&mut self, requested: ServiceSet) -> Result<Vec<ServiceSet>, ChannelError> {
        let mut services = Self::individual(requested)?;
        if let Some(s) = services.iter().find(|s| self.state(**s) != ServiceState::Running) {
            return Err(ChannelError::IllegalState(format!("service {} is not running ({:?})", s, self.state(*s))));
        }
        for s in &services {
            self.states[s.index()] = ServiceState::Stopping;
        }
        services.reverse();
        Ok(services)
    }

    /// completes a transition: `Starting` becomes `Running` on success, everything else becomes
    ///  `Stopped`
    pub fn finish(&mut self, service: ServiceSet, success: bool) {
        let state = &mut self.states[service.index()];
        *state = match (*state, success) {
            (ServiceState::Starting, true) => ServiceState::Running,
            _ => ServiceState::Stopped,
        };
    }

    fn individual(requested: ServiceSet) -> Result<Vec<ServiceSet>, ChannelError> {
        if requested.is_empty() {
            return Err(ChannelError::Config("no service requested".to_string()));
        }
        Ok(ServiceSet::START_ORDER.iter()
            .filter(|s| requested.contains(**s))
            .copied()
            .collect())
    }
}
