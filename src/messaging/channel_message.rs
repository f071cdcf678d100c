use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::channel::send_options::SendOptions;
use crate::membership::member::Member;

pub const UNIQUE_ID_LEN: usize = 16;

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifies a message for correlation with acknowledgements. It is built from the first
///  eight bytes of the sending member's unique id and a process-wide counter.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UniqueId(pub [u8; UNIQUE_ID_LEN]);

impl UniqueId {
    pub fn new_for(sender: &Member) -> UniqueId {
        let counter = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);

        let mut raw = [0u8; UNIQUE_ID_LEN];
        raw[..8].copy_from_slice(&sender.unique_id().0[..8]);
        raw[8..].copy_from_slice(&counter.to_be_bytes());
        UniqueId(raw)
    }
}

impl Debug for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
impl Display for UniqueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// The envelope of a message in transit. It is never modified once it is created: interceptors
///  that transform messages create new instances using the `with_*` functions.
#[derive(Clone, Debug)]
pub struct ChannelMessage {
    pub unique_id: UniqueId,
    /// the originating member
    pub address: Member,
    /// millis since epoch, at the time the message was created
    pub timestamp: u64,
    pub options: SendOptions,
    pub payload: Bytes,
}

impl ChannelMessage {
    pub fn new(address: Member, payload: Bytes, options: SendOptions) -> ChannelMessage {
        ChannelMessage {
            unique_id: UniqueId::new_for(&address),
            address,
            timestamp: millis_since_epoch(),
            options,
            payload,
        }
    }

    pub fn with_payload(&self, payload: Bytes) -> ChannelMessage {
        ChannelMessage {
            payload,
            ..self.clone()
        }
    }

    pub fn with_options(&self, options: SendOptions) -> ChannelMessage {
        ChannelMessage {
            options,
            ..self.clone()
        }
    }

    pub fn with_unique_id(&self, unique_id: UniqueId) -> ChannelMessage {
        ChannelMessage {
            unique_id,
            ..self.clone()
        }
    }
}

pub fn millis_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
