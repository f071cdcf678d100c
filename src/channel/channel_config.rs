use std::time::Duration;

use anyhow::bail;

use crate::interceptor::message_dispatch::MessageDispatchConfig;
use crate::membership::membership_config::MembershipConfig;
use crate::transport::receiver_config::ReceiverConfig;
use crate::transport::sender_config::SenderConfig;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// used in log output to tell several channels in the same process apart
    pub name: String,

    pub receiver: ReceiverConfig,
    pub sender: SenderConfig,
    pub membership: MembershipConfig,

    /// If this is set, a [crate::interceptor::message_dispatch::MessageDispatchInterceptor] is
    ///  added when the channel is created, handling messages with the ASYNCHRONOUS option
    pub dispatch: Option<MessageDispatchConfig>,

    /// run the channel's heartbeat on a background task while the channel is started
    pub heartbeat: bool,
    pub heartbeat_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            name: "GroupChannel".to_string(),
            receiver: Default::default(),
            sender: Default::default(),
            membership: Default::default(),
            dispatch: Some(Default::default()),
            heartbeat: true,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl ChannelConfig {
    /// A config for a channel that communicates over the loopback interface only, with a static
    ///  list of membership ports instead of multicast
    pub fn localhost(name: &str, port: u16, membership_port: u16, all_membership_ports: &[u16]) -> ChannelConfig {
        let mut membership = MembershipConfig::localhost(membership_port, all_membership_ports);
        membership.local_name = name.to_string();

        ChannelConfig {
            name: name.to_string(),
            receiver: ReceiverConfig::localhost(port),
            membership,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat && self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        self.receiver.validate()?;
        self.sender.validate()?;
        self.membership.validate()?;
        if let Some(dispatch) = &self.dispatch {
            dispatch.validate()?;
        }
        Ok(())
    }
}
