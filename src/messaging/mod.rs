use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::channel_message::ChannelMessage;

pub mod channel_message;
pub mod frame;

/// Receives decoded messages from the transport (both the receiver and the membership
///  broadcast). This decouples the transport from the processing of messages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    /// a message that is not accepted is discarded without further processing
    fn accept(&self, msg: &ChannelMessage) -> bool;

    async fn message_received(&self, msg: ChannelMessage) -> anyhow::Result<()>;
}
