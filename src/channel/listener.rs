use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::channel::error::ChannelError;
use crate::membership::member::Member;
use crate::messaging::channel_message::{ChannelMessage, UniqueId};

/// Application callback for messages received by the channel. A message is handed to every
///  registered listener that accepts it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelListener: Send + Sync + 'static {
    fn accept(&self, _msg: &ChannelMessage) -> bool {
        true
    }

    /// An error returned here is logged, and if the sender requested a synchronized ack, it is
    ///  reported back to the sender as a failed ack.
    async fn message_received(&self, msg: ChannelMessage) -> anyhow::Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipListener: Send + Sync + 'static {
    async fn member_added(&self, member: &Member);

    async fn member_disappeared(&self, member: &Member);
}

/// Receives the outcome of a send that was started with
///  [crate::channel::channel::GroupChannel::send_with_handler]. Exactly one of the two callbacks
///  is called per message.
#[cfg_attr(test, automock)]
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle_error(&self, err: ChannelError, id: UniqueId);

    fn handle_completion(&self, id: UniqueId);
}
