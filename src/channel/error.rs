use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use crate::membership::member::Member;
use crate::messaging::channel_message::UniqueId;

/// Errors that are visible to callers of the channel API.
///
/// Configuration problems are reported when the offending call is made, transport problems
///  are reported to the caller of `send` / `start` (or to an [crate::channel::listener::ErrorHandler]),
///  and ack timeouts are distinct from ack rejections so callers can tell "never arrived" from
///  "arrived but rejected".
#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    #[error("[{0}] is not a valid send option")]
    InvalidOption(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("unable to bind to {addr} after {attempts} attempt(s): {source}")]
    Bind {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("no destination given")]
    NoDestination,
    #[error("message queue is full")]
    QueueFull,
    #[error("{0}")]
    Send(FaultyMembers),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChannelError {
    /// members for which sending failed, empty if the error is not about specific destinations
    pub fn faulty_members(&self) -> &[FaultyMember] {
        match self {
            ChannelError::Send(faulty) => &faulty.0,
            _ => &[],
        }
    }

    pub fn send_failure(member: Member, cause: SendFailure) -> ChannelError {
        ChannelError::Send(FaultyMembers(vec![FaultyMember { member, cause }]))
    }
}

/// The failures of a message that was sent to several destinations, one entry per destination
///  that failed.
#[derive(Debug)]
pub struct FaultyMembers(pub Vec<FaultyMember>);
impl Display for FaultyMembers {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sending failed for {} member(s):", self.0.len())?;
        for faulty in &self.0 {
            write!(f, " [{}: {}]", faulty.member, faulty.cause)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FaultyMember {
    pub member: Member,
    pub cause: SendFailure,
}

#[derive(thiserror::Error, Debug)]
pub enum SendFailure {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no ack received within {0:?}")]
    AckTimeout(Duration),
    #[error("receiver rejected message {0}")]
    AckRejected(UniqueId),
    #[error("member has no UDP port")]
    NoUdpPort,
    #[error("{0}")]
    Other(anyhow::Error),
}

impl SendFailure {
    pub fn is_ack_timeout(&self) -> bool {
        matches!(self, SendFailure::AckTimeout(_))
    }
}

/// Combines per-destination results into a single result, keeping every failure
pub fn collect_failures(failures: Vec<FaultyMember>) -> Result<(), ChannelError> {
    if failures.is_empty() {
        Ok(())
    }
    else {
        Err(ChannelError::Send(FaultyMembers(failures)))
    }
}
