use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::channel::listener::{ChannelListener, MembershipListener};
use crate::membership::member::Member;
use crate::messaging::channel_message::ChannelMessage;

/// the maximum time the `next_*` functions wait before they panic
pub const RECORDING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MembershipEvent {
    Added(Member),
    Disappeared(Member),
}

/// A [MembershipListener] that makes all events available for polling by test code
pub struct RecordingMembershipListener {
    send: mpsc::UnboundedSender<MembershipEvent>,
    receive: Mutex<mpsc::UnboundedReceiver<MembershipEvent>>,
}

impl Default for RecordingMembershipListener {
    fn default() -> Self {
        let (send, receive) = mpsc::unbounded_channel();
        RecordingMembershipListener {
            send,
            receive: Mutex::new(receive),
        }
    }
}

impl RecordingMembershipListener {
    /// waits for the next event, panicking if there is none after [RECORDING_TIMEOUT]
    pub async fn next_event(&self) -> MembershipEvent {
        let mut receive = self.receive.lock().await;
        tokio::time::timeout(RECORDING_TIMEOUT, receive.recv()).await
            .expect("timeout waiting for membership event")
            .expect("event channel closed")
    }

    pub fn try_next_event(&self) -> Option<MembershipEvent> {
        self.receive.try_lock().ok()?
            .try_recv().ok()
    }
}

#[async_trait]
impl MembershipListener for RecordingMembershipListener {
    async fn member_added(&self, member: &Member) {
        let _ = self.send.send(MembershipEvent::Added(member.clone()));
    }

    async fn member_disappeared(&self, member: &Member) {
        let _ = self.send.send(MembershipEvent::Disappeared(member.clone()));
    }
}

/// A [ChannelListener] that makes all received messages available for polling by test code
pub struct RecordingChannelListener {
    send: mpsc::UnboundedSender<ChannelMessage>,
    receive: Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    accept_prefix: Option<Vec<u8>>,
    failing: AtomicBool,
}

impl Default for RecordingChannelListener {
    fn default() -> Self {
        let (send, receive) = mpsc::unbounded_channel();
        RecordingChannelListener {
            send,
            receive: Mutex::new(receive),
            accept_prefix: None,
            failing: AtomicBool::new(false),
        }
    }
}

impl RecordingChannelListener {
    /// only accept messages whose payload starts with the given prefix
    pub fn accepting_prefix(prefix: &[u8]) -> RecordingChannelListener {
        RecordingChannelListener {
            accept_prefix: Some(prefix.to_vec()),
            ..Default::default()
        }
    }

    /// makes processing of all subsequent messages fail (after they were recorded)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub async fn next_message(&self) -> ChannelMessage {
        let mut receive = self.receive.lock().await;
        tokio::time::timeout(RECORDING_TIMEOUT, receive.recv()).await
            .expect("timeout waiting for message")
            .expect("message channel closed")
    }

    pub fn try_next_message(&self) -> Option<ChannelMessage> {
        self.receive.try_lock().ok()?
            .try_recv().ok()
    }
}

#[async_trait]
impl ChannelListener for RecordingChannelListener {
    fn accept(&self, msg: &ChannelMessage) -> bool {
        match &self.accept_prefix {
            Some(prefix) => msg.payload.starts_with(prefix),
            None => true,
        }
    }

    async fn message_received(&self, msg: ChannelMessage) -> anyhow::Result<()> {
        let _ = self.send.send(msg);
        if self.failing.load(Ordering::Acquire) {
            anyhow::bail!("listener is failing");
        }
        Ok(())
    }
}
