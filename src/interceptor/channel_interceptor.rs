use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::channel::error::ChannelError;
use crate::channel::listener::ErrorHandler;
use crate::channel::send_options::SendOptions;
use crate::channel::services::ServiceSet;
use crate::membership::member::Member;
use crate::messaging::channel_message::ChannelMessage;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendOutcome {
    /// The message was handed to the transport, and acks (if requested) were received
    Sent,
    /// The message was queued for later sending. Whoever queued it is responsible for reporting
    ///  the outcome to the message's error handler (if any).
    Queued,
}

/// A processing step in the channel's stack of interceptors. Outgoing messages pass through the
///  interceptors top-down before they reach the transport, incoming messages and membership
///  events pass bottom-up before they reach the application's listeners.
///
/// All callbacks have default implementations that just pass the call on, so an interceptor
///  overrides only what it cares about. An interceptor that does not call `next` swallows the
///  message or event.
#[async_trait]
pub trait ChannelInterceptor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// If this is non-empty, the interceptor only processes messages that have (all of) these
    ///  options set, and is skipped transparently for all other messages. No two interceptors
    ///  in a chain may share the same non-empty flag.
    fn option_flag(&self) -> SendOptions {
        SendOptions::empty()
    }

    /// Consulted by the receiver before a message is processed at all. Not accepting a message
    ///  drops it silently.
    fn accept(&self, _msg: &ChannelMessage) -> bool {
        true
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>, next: DownChain) -> Result<SendOutcome, ChannelError> {
        next.send_message(destinations, msg, handler).await
    }

    async fn message_received(&self, msg: ChannelMessage, next: UpChain) -> anyhow::Result<()> {
        next.message_received(msg).await
    }

    async fn member_added(&self, member: &Member, next: UpChain) {
        next.member_added(member).await
    }

    async fn member_disappeared(&self, member: &Member, next: UpChain) {
        next.member_disappeared(member).await
    }

    async fn heartbeat(&self) {}

    async fn start(&self, _svc: ServiceSet) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn stop(&self, _svc: ServiceSet) -> Result<(), ChannelError> {
        Ok(())
    }
}

fn is_active(interceptor: &dyn ChannelInterceptor, options: SendOptions) -> bool {
    options.contains(interceptor.option_flag())
}

/// The end of the chain on the way down, i.e. the part that actually sends messages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainBottom: Send + Sync + 'static {
    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage) -> Result<(), ChannelError>;
}

/// The end of the chain on the way up, i.e. the application's listeners
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainTop: Send + Sync + 'static {
    async fn message_received(&self, msg: ChannelMessage) -> anyhow::Result<()>;
    async fn member_added(&self, member: &Member);
    async fn member_disappeared(&self, member: &Member);
}

struct ChainInner {
    interceptors: Vec<Arc<dyn ChannelInterceptor>>,
    /// The bottom owns the receiving side of the transport which in turn delivers into the
    ///  chain, so the chain must not keep it alive
    bottom: Weak<dyn ChainBottom>,
    top: Arc<dyn ChainTop>,
}

/// An immutable, ordered stack of interceptors between a top and a bottom.
#[derive(Clone)]
pub struct InterceptorChain {
    inner: Arc<ChainInner>,
}

impl Debug for InterceptorChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = self.inner.interceptors.iter()
            .map(|i| i.name())
            .collect::<Vec<_>>();
        write!(f, "InterceptorChain{:?}", names)
    }
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn ChannelInterceptor>>, bottom: &Arc<dyn ChainBottom>, top: Arc<dyn ChainTop>) -> Result<InterceptorChain, ChannelError> {
        option_check(&interceptors)?;

        Ok(InterceptorChain {
            inner: Arc::new(ChainInner {
                interceptors,
                bottom: Arc::downgrade(bottom),
                top,
            })
        })
    }

    pub fn interceptors(&self) -> &[Arc<dyn ChannelInterceptor>] {
        &self.inner.interceptors
    }

    /// cursor for sending a message through the entire chain
    pub fn down(&self) -> DownChain {
        DownChain {
            inner: self.inner.clone(),
            next_index: 0,
        }
    }

    /// cursor for passing a received message or event through the entire chain
    pub fn up(&self) -> UpChain {
        UpChain {
            inner: self.inner.clone(),
            remaining: self.inner.interceptors.len(),
        }
    }

    pub fn accept(&self, msg: &ChannelMessage) -> bool {
        self.inner.interceptors.iter()
            .filter(|i| is_active(i.as_ref(), msg.options))
            .all(|i| i.accept(msg))
    }
}

/// An owned cursor into the chain on the way down. It can be moved to a different task and
///  continued there.
#[derive(Clone)]
pub struct DownChain {
    inner: Arc<ChainInner>,
    next_index: usize,
}

impl DownChain {
    pub async fn send_message(self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>) -> Result<SendOutcome, ChannelError> {
        let interceptors = &self.inner.interceptors;
        for idx in self.next_index..interceptors.len() {
            let interceptor = &interceptors[idx];
            if is_active(interceptor.as_ref(), msg.options) {
                trace!(interceptor = interceptor.name(), id = ?msg.unique_id, "sending through interceptor");
                let next = DownChain {
                    inner: self.inner.clone(),
                    next_index: idx + 1,
                };
                return interceptor.send_message(destinations, msg, handler, next).await;
            }
        }

        let bottom = self.inner.bottom.upgrade()
            .ok_or_else(|| ChannelError::IllegalState("channel was discarded".to_string()))?;
        bottom.send_message(destinations, msg).await?;
        Ok(SendOutcome::Sent)
    }
}

/// An owned cursor into the chain on the way up.
#[derive(Clone)]
pub struct UpChain {
    inner: Arc<ChainInner>,
    /// number of interceptors that were not visited yet
    remaining: usize,
}

impl UpChain {
    fn next_interceptor(&self, options: Option<SendOptions>) -> Option<(&Arc<dyn ChannelInterceptor>, UpChain)> {
        (0..self.remaining)
            .rev()
            .map(|idx| (idx, &self.inner.interceptors[idx]))
            .find(|(_, i)| options.map(|o| is_active(i.as_ref(), o)).unwrap_or(true))
            .map(|(idx, i)| (i, UpChain { inner: self.inner.clone(), remaining: idx }))
    }

    pub async fn message_received(self, msg: ChannelMessage) -> anyhow::Result<()> {
        match self.next_interceptor(Some(msg.options)) {
            Some((interceptor, next)) => {
                trace!(interceptor = interceptor.name(), id = ?msg.unique_id, "receiving through interceptor");
                interceptor.message_received(msg, next).await
            }
            None => self.inner.top.message_received(msg).await,
        }
    }

    pub async fn member_added(self, member: &Member) {
        match self.next_interceptor(None) {
            Some((interceptor, next)) => interceptor.member_added(member, next).await,
            None => self.inner.top.member_added(member).await,
        }
    }

    pub async fn member_disappeared(self, member: &Member) {
        match self.next_interceptor(None) {
            Some((interceptor, next)) => interceptor.member_disappeared(member, next).await,
            None => self.inner.top.member_disappeared(member).await,
        }
    }
}

/// Verifies that no two interceptors claim the same option flag
pub fn option_check(interceptors: &[Arc<dyn ChannelInterceptor>]) -> Result<(), ChannelError> {
    let mut claimed: FxHashMap<SendOptions, &str> = FxHashMap::default();
    for interceptor in interceptors {
        let flag = interceptor.option_flag();
        if flag.is_empty() {
            continue;
        }
        if let Some(other) = claimed.insert(flag, interceptor.name()) {
            return Err(ChannelError::Config(format!(
                "interceptor option flag conflict: {} and {} both use {}", other, interceptor.name(), flag
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use mockall::predicate::eq;

    use crate::test_util::interceptor::RecordingInterceptor;
    use crate::test_util::member::test_member;
    use super::*;

    fn msg(options: SendOptions) -> ChannelMessage {
        ChannelMessage::new(test_member(1), Bytes::from_static(b"abc"), options)
    }

    fn chain(interceptors: Vec<Arc<dyn ChannelInterceptor>>, bottom: MockChainBottom, top: MockChainTop) -> (InterceptorChain, Arc<dyn ChainBottom>) {
        let bottom: Arc<dyn ChainBottom> = Arc::new(bottom);
        let chain = InterceptorChain::new(interceptors, &bottom, Arc::new(top)).unwrap();
        (chain, bottom)
    }

    #[tokio::test]
    async fn test_traversal_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let i1: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("i1", SendOptions::empty(), log.clone()));
        let i2: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("i2", SendOptions::empty(), log.clone()));

        let mut bottom = MockChainBottom::new();
        let bottom_log = log.clone();
        bottom.expect_send_message()
            .once()
            .returning(move |_, _| {
                bottom_log.lock().unwrap().push("bottom".to_string());
                Ok(())
            });
        let mut top = MockChainTop::new();
        let top_log = log.clone();
        top.expect_message_received()
            .once()
            .returning(move |_| {
                top_log.lock().unwrap().push("top".to_string());
                Ok(())
            });

        let (chain, _bottom) = chain(vec![i1, i2], bottom, top);

        let outcome = chain.down().send_message(vec![test_member(2)], msg(SendOptions::USE_ACK), None).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        chain.up().message_received(msg(SendOptions::USE_ACK)).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["i1:send", "i2:send", "bottom", "i2:received", "i1:received", "top"]);
    }

    #[tokio::test]
    async fn test_inactive_interceptor_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let plain: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("plain", SendOptions::empty(), log.clone()));
        let secure: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("secure", SendOptions::SECURE, log.clone()));

        let mut bottom = MockChainBottom::new();
        bottom.expect_send_message().times(2).returning(|_, _| Ok(()));
        let mut top = MockChainTop::new();
        top.expect_message_received().times(2).returning(|_| Ok(()));

        let (chain, _bottom) = chain(vec![secure, plain], bottom, top);

        chain.down().send_message(vec![test_member(2)], msg(SendOptions::USE_ACK), None).await.unwrap();
        chain.up().message_received(msg(SendOptions::USE_ACK)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["plain:send", "plain:received"]);

        log.lock().unwrap().clear();
        chain.down().send_message(vec![test_member(2)], msg(SendOptions::SECURE), None).await.unwrap();
        chain.up().message_received(msg(SendOptions::SECURE)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["secure:send", "plain:send", "plain:received", "secure:received"]);
    }

    #[tokio::test]
    async fn test_membership_events_pass_all_interceptors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let secure: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("secure", SendOptions::SECURE, log.clone()));

        let mut top = MockChainTop::new();
        top.expect_member_added()
            .with(eq(test_member(5)))
            .once()
            .return_const(());
        top.expect_member_disappeared()
            .with(eq(test_member(5)))
            .once()
            .return_const(());

        let (chain, _bottom) = chain(vec![secure], MockChainBottom::new(), top);
        chain.up().member_added(&test_member(5)).await;
        chain.up().member_disappeared(&test_member(5)).await;

        assert_eq!(*log.lock().unwrap(), vec!["secure:added", "secure:disappeared"]);
    }

    #[tokio::test]
    async fn test_bottom_error_is_propagated() {
        let mut bottom = MockChainBottom::new();
        bottom.expect_send_message()
            .returning(|_, _| Err(ChannelError::NoDestination));

        let (chain, _bottom) = chain(vec![], bottom, MockChainTop::new());
        let result = chain.down().send_message(vec![], msg(SendOptions::empty()), None).await;
        assert!(matches!(result, Err(ChannelError::NoDestination)));
    }

    #[tokio::test]
    async fn test_discarded_bottom() {
        let (chain, bottom) = chain(vec![], MockChainBottom::new(), MockChainTop::new());
        drop(bottom);

        let result = chain.down().send_message(vec![test_member(2)], msg(SendOptions::empty()), None).await;
        assert!(matches!(result, Err(ChannelError::IllegalState(_))));
    }

    #[test]
    fn test_option_check() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("a", SendOptions::SECURE, log.clone()));
        let b: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("b", SendOptions::empty(), log.clone()));
        let c: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("c", SendOptions::empty(), log.clone()));
        let d: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("d", SendOptions::SECURE, log.clone()));

        assert!(option_check(&[a.clone(), b, c]).is_ok());
        assert!(matches!(option_check(&[a, d]), Err(ChannelError::Config(_))));
    }

    #[test]
    fn test_accept() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rejecting: Arc<dyn ChannelInterceptor> = Arc::new(RecordingInterceptor::new("r", SendOptions::SECURE, log).rejecting());
        let (chain, _bottom) = chain(vec![rejecting], MockChainBottom::new(), MockChainTop::new());

        assert!(chain.accept(&msg(SendOptions::USE_ACK)));
        assert!(!chain.accept(&msg(SendOptions::SECURE)));
    }
}
