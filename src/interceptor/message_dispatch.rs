use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::channel::error::ChannelError;
use crate::channel::listener::ErrorHandler;
use crate::channel::send_options::SendOptions;
use crate::channel::services::ServiceSet;
use crate::interceptor::channel_interceptor::{ChannelInterceptor, DownChain, SendOutcome};
use crate::membership::member::Member;
use crate::messaging::channel_message::ChannelMessage;

#[derive(Debug, Clone)]
pub struct MessageDispatchConfig {
    /// upper limit for the accumulated payload size of queued messages
    pub max_queue_size: usize,
    /// optional upper limit for the number of queued messages
    pub max_queue_messages: Option<usize>,
    /// If the queue is full, send the message synchronously on the caller's task. Otherwise
    ///  sending fails with [ChannelError::QueueFull].
    pub always_send: bool,
}

impl Default for MessageDispatchConfig {
    fn default() -> Self {
        MessageDispatchConfig {
            max_queue_size: 64 * 1024 * 1024,
            max_queue_messages: None,
            always_send: true,
        }
    }
}

impl MessageDispatchConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_queue_size == 0 || self.max_queue_messages == Some(0) {
            anyhow::bail!("message dispatch queue limits must be positive");
        }
        Ok(())
    }
}

struct QueuedMessage {
    destinations: Vec<Member>,
    msg: ChannelMessage,
    handler: Option<Arc<dyn ErrorHandler>>,
    next: DownChain,
}

#[derive(Default)]
struct QueueUsage {
    bytes: AtomicUsize,
    messages: AtomicUsize,
}

/// Sends messages with the [SendOptions::ASYNCHRONOUS] option on a background task, returning
///  to the caller as soon as the message is queued. The outcome is reported to the message's
///  [ErrorHandler] if there is one.
pub struct MessageDispatchInterceptor {
    config: MessageDispatchConfig,
    usage: Arc<QueueUsage>,
    queue: Mutex<Option<mpsc::UnboundedSender<QueuedMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatchInterceptor {
    pub fn new(config: MessageDispatchConfig) -> MessageDispatchInterceptor {
        MessageDispatchInterceptor {
            config,
            usage: Default::default(),
            queue: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MessageDispatchConfig {
        &self.config
    }

    pub fn queued_bytes(&self) -> usize {
        self.usage.bytes.load(Ordering::Acquire)
    }

    pub fn queued_messages(&self) -> usize {
        self.usage.messages.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.queue.lock().unwrap().is_some()
    }

    fn try_reserve(&self, size: usize) -> bool {
        let max_messages = self.config.max_queue_messages.unwrap_or(usize::MAX);
        if self.usage.messages.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max_messages).then_some(n + 1)).is_err() {
            return false;
        }
        // a single message larger than the queue is always accepted into an empty queue
        let reserved = self.usage.bytes.fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| {
            (b == 0 || b.saturating_add(size) <= self.config.max_queue_size).then_some(b + size)
        });
        if reserved.is_err() {
            self.usage.messages.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }
}

impl QueueUsage {
    fn release(&self, size: usize) {
        self.bytes.fetch_sub(size, Ordering::AcqRel);
        self.messages.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl ChannelInterceptor for MessageDispatchInterceptor {
    fn name(&self) -> &str {
        "MessageDispatchInterceptor"
    }

    fn option_flag(&self) -> SendOptions {
        SendOptions::ASYNCHRONOUS
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>, next: DownChain) -> Result<SendOutcome, ChannelError> {
        let queue = self.queue.lock().unwrap().clone()
            .ok_or_else(|| ChannelError::IllegalState("message dispatch is not running".to_string()))?;

        let size = msg.payload.len();
        if !self.try_reserve(size) {
            if self.config.always_send {
                debug!(id = ?msg.unique_id, "dispatch queue is full, sending synchronously");
                return next.send_message(destinations, msg, handler).await;
            }
            return Err(ChannelError::QueueFull);
        }

        trace!(id = ?msg.unique_id, "queueing message for asynchronous sending");
        let queued = QueuedMessage { destinations, msg, handler, next };
        if queue.send(queued).is_err() {
            self.usage.release(size);
            return Err(ChannelError::IllegalState("message dispatch was stopped".to_string()));
        }
        Ok(SendOutcome::Queued)
    }

    async fn start(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        if !svc.contains(ServiceSet::SND_TX_SEQ) || self.is_running() {
            return Ok(());
        }
        self.config.validate()
            .map_err(|e| ChannelError::Config(e.to_string()))?;

        let (send, receive) = mpsc::unbounded_channel();
        let handle = tokio::spawn(dispatch_loop(receive, self.usage.clone()));
        *self.queue.lock().unwrap() = Some(send);
        *self.task.lock().unwrap() = Some(handle);
        debug!("message dispatch started");
        Ok(())
    }

    /// Closes the queue and waits until all messages that were queued before are processed
    async fn stop(&self, svc: ServiceSet) -> Result<(), ChannelError> {
        if !svc.contains(ServiceSet::SND_TX_SEQ) {
            return Ok(());
        }
        self.queue.lock().unwrap().take();
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("message dispatch task terminated abnormally: {}", e);
            }
        }
        debug!("message dispatch stopped");
        Ok(())
    }
}

async fn dispatch_loop(mut receive: mpsc::UnboundedReceiver<QueuedMessage>, usage: Arc<QueueUsage>) {
    while let Some(queued) = receive.recv().await {
        let size = queued.msg.payload.len();
        let id = queued.msg.unique_id;

        let result = queued.next.send_message(queued.destinations, queued.msg, queued.handler.clone()).await;
        usage.release(size);

        match (result, queued.handler) {
            (Ok(SendOutcome::Sent), Some(handler)) => handler.handle_completion(id),
            (Ok(_), _) => {}
            (Err(e), Some(handler)) => handler.handle_error(e, id),
            (Err(e), None) => warn!(?id, "asynchronous send failed: {}", e),
        }
    }
}
