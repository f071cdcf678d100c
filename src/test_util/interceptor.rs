use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::channel::error::ChannelError;
use crate::channel::listener::ErrorHandler;
use crate::channel::send_options::SendOptions;
use crate::interceptor::channel_interceptor::{ChannelInterceptor, DownChain, SendOutcome, UpChain};
use crate::membership::member::Member;
use crate::messaging::channel_message::ChannelMessage;

/// An interceptor that passes everything on, appending `"<name>:<callback>"` to a shared log
///  for every call. This is useful for verifying traversal order.
pub struct RecordingInterceptor {
    name: String,
    flag: SendOptions,
    log: Arc<Mutex<Vec<String>>>,
    accepting: bool,
}

impl RecordingInterceptor {
    pub fn new(name: &str, flag: SendOptions, log: Arc<Mutex<Vec<String>>>) -> RecordingInterceptor {
        RecordingInterceptor {
            name: name.to_string(),
            flag,
            log,
            accepting: true,
        }
    }

    /// does not accept any message
    pub fn rejecting(self) -> RecordingInterceptor {
        RecordingInterceptor {
            accepting: false,
            ..self
        }
    }

    fn record(&self, what: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, what));
    }
}

#[async_trait]
impl ChannelInterceptor for RecordingInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn option_flag(&self) -> SendOptions {
        self.flag
    }

    fn accept(&self, _msg: &ChannelMessage) -> bool {
        self.accepting
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>, next: DownChain) -> Result<SendOutcome, ChannelError> {
        self.record("send");
        next.send_message(destinations, msg, handler).await
    }

    async fn message_received(&self, msg: ChannelMessage, next: UpChain) -> anyhow::Result<()> {
        self.record("received");
        next.message_received(msg).await
    }

    async fn member_added(&self, member: &Member, next: UpChain) {
        self.record("added");
        next.member_added(member).await
    }

    async fn member_disappeared(&self, member: &Member, next: UpChain) {
        self.record("disappeared");
        next.member_disappeared(member).await
    }
}
