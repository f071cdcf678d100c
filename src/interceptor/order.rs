use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel::error::{collect_failures, ChannelError, FaultyMember};
use crate::channel::listener::ErrorHandler;
use crate::channel::services::ServiceSet;
use crate::interceptor::channel_interceptor::{ChannelInterceptor, DownChain, SendOutcome, UpChain};
use crate::membership::member::{Member, MemberId};
use crate::messaging::channel_message::ChannelMessage;

#[derive(Debug, Clone)]
pub struct OrderConfig {
    /// a gap in the sequence is skipped if a message was held for longer than this
    pub expire: Duration,
    /// a gap in the sequence is skipped if more than this many messages are held for a sender
    pub max_queue: usize,
}

impl Default for OrderConfig {
    fn default() -> Self {
        OrderConfig {
            expire: Duration::from_secs(3),
            max_queue: 128,
        }
    }
}

struct HeldMessage {
    msg: ChannelMessage,
    next: UpChain,
    received: Instant,
    /// the outcome of the delivery is reported to the task that received the message
    done: oneshot::Sender<anyhow::Result<()>>,
}

#[derive(Default)]
struct Incoming {
    expected: u64,
    held: BTreeMap<u64, HeldMessage>,
}

impl Incoming {
    /// removes held messages that can be delivered, skipping a gap if `force` is set
    fn take_deliverable(&mut self, force: bool) -> Vec<HeldMessage> {
        if force {
            if let Some((&first, _)) = self.held.first_key_value() {
                if first > self.expected {
                    debug!("skipping missing messages {}..{}", self.expected, first);
                    self.expected = first;
                }
            }
        }

        let mut result = Vec::new();
        while let Some(held) = self.held.remove(&self.expected) {
            result.push(held);
            self.expected += 1;
        }
        result
    }

    fn oldest(&self) -> Option<Instant> {
        self.held.values()
            .map(|h| h.received)
            .min()
    }
}

/// Per-sender state. Deliveries happen while the sender's lock is held, so two messages from
///  the same sender can not overtake each other after being put in order.
type SenderState = Arc<tokio::sync::Mutex<Incoming>>;

/// Guarantees that messages from one sender are delivered in the order in which they were sent.
///  Each message carries a sequence number per (sender, receiver) pair. The receiving side holds
///  back messages that arrive early until the gap closes, or until the configured limits are
///  exceeded.
///
/// Receiving a held message completes only after it was delivered, so its outcome (and a
///  synchronized ack) reflects the actual processing. A held message that is discarded because
///  its sender disappeared fails.
///
/// Since the sequence number depends on the destination, a message to several destinations is
///  sent separately to each of them.
pub struct OrderInterceptor {
    config: OrderConfig,
    outgoing: Mutex<FxHashMap<Member, u64>>,
    incoming: Mutex<FxHashMap<MemberId, SenderState>>,
}

impl OrderInterceptor {
    pub fn new(config: OrderConfig) -> OrderInterceptor {
        OrderInterceptor {
            config,
            outgoing: Default::default(),
            incoming: Default::default(),
        }
    }

    /// the number of messages that are currently held back, for all senders
    pub async fn held(&self) -> usize {
        let mut result = 0;
        for state in self.sender_states() {
            result += state.lock().await.held.len();
        }
        result
    }

    fn sender_states(&self) -> Vec<SenderState> {
        self.incoming.lock().unwrap()
            .values()
            .cloned()
            .collect()
    }

    fn sender_state(&self, sender: MemberId) -> SenderState {
        self.incoming.lock().unwrap()
            .entry(sender)
            .or_default()
            .clone()
    }

    fn next_sequence_number(&self, destination: &Member) -> u64 {
        let mut outgoing = self.outgoing.lock().unwrap();
        let counter = outgoing.entry(destination.clone()).or_default();
        let result = *counter;
        *counter += 1;
        result
    }

    async fn deliver_all(deliverable: Vec<HeldMessage>) {
        for held in deliverable {
            let result = held.next.message_received(held.msg).await;
            // the receiving task may be gone, e.g. if its connection was closed
            let _ = held.done.send(result);
        }
    }
}

#[async_trait]
impl ChannelInterceptor for OrderInterceptor {
    fn name(&self) -> &str {
        "OrderInterceptor"
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>, next: DownChain) -> Result<SendOutcome, ChannelError> {
        let mut outcome = SendOutcome::Sent;
        let mut failures: Vec<FaultyMember> = Vec::new();

        for destination in destinations {
            let mut payload = BytesMut::with_capacity(msg.payload.len() + 8);
            payload.put_u64(self.next_sequence_number(&destination));
            payload.put_slice(&msg.payload);

            match next.clone().send_message(vec![destination], msg.with_payload(payload.freeze()), handler.clone()).await {
                Ok(SendOutcome::Queued) => outcome = SendOutcome::Queued,
                Ok(SendOutcome::Sent) => {}
                Err(ChannelError::Send(faulty)) => failures.extend(faulty.0),
                Err(e) => return Err(e),
            }
        }

        collect_failures(failures)?;
        Ok(outcome)
    }

    async fn message_received(&self, msg: ChannelMessage, next: UpChain) -> anyhow::Result<()> {
        let mut payload = msg.payload.clone();
        let sequence_number = payload.try_get_u64()?;
        let msg = msg.with_payload(payload);
        let id = msg.unique_id;

        let completion = {
            let state = self.sender_state(msg.address.unique_id());
            let mut state = state.lock().await;

            if sequence_number < state.expected {
                debug!(?id, "discarding message {} that arrived after its gap was skipped", sequence_number);
                bail!("message {} arrived after its gap in the sequence was skipped", id);
            }
            if sequence_number == state.expected {
                state.expected += 1;
                let result = next.message_received(msg).await;
                let deliverable = state.take_deliverable(false);
                Self::deliver_all(deliverable).await;
                return result;
            }

            trace!(?id, "holding message {}, expecting {}", sequence_number, state.expected);
            let (done, completion) = oneshot::channel();
            state.held.insert(sequence_number, HeldMessage { msg, next, received: Instant::now(), done });
            if state.held.len() > self.config.max_queue {
                let deliverable = state.take_deliverable(true);
                Self::deliver_all(deliverable).await;
            }
            completion
        };

        completion.await
            .map_err(|_| anyhow!("message {} was discarded while it was held back", id))?
    }

    async fn member_disappeared(&self, member: &Member, next: UpChain) {
        self.outgoing.lock().unwrap().remove(member);
        // dropping the state fails all messages held for the member
        let removed = self.incoming.lock().unwrap().remove(&member.unique_id());
        drop(removed);
        next.member_disappeared(member).await
    }

    async fn heartbeat(&self) {
        let now = Instant::now();
        for state in self.sender_states() {
            // a sender whose lock is taken is delivering right now, it is checked next time
            let Ok(mut state) = state.try_lock() else {
                continue;
            };
            let expired = state.oldest()
                .map(|t| now.duration_since(t) > self.config.expire)
                .unwrap_or(false);
            if expired {
                let deliverable = state.take_deliverable(true);
                Self::deliver_all(deliverable).await;
            }
        }
    }

    async fn start(&self, _svc: ServiceSet) -> Result<(), ChannelError> {
        if self.config.max_queue == 0 {
            return Err(ChannelError::Config("max_queue of the order interceptor must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::task::JoinHandle;

    use crate::channel::send_options::SendOptions;
    use crate::interceptor::channel_interceptor::{ChainBottom, InterceptorChain, MockChainBottom, MockChainTop};
    use crate::test_util::member::test_member;
    use super::*;

    struct Setup {
        chain: InterceptorChain,
        order: Arc<OrderInterceptor>,
        sent: Arc<Mutex<Vec<(Vec<Member>, ChannelMessage)>>>,
        received: Arc<Mutex<Vec<Bytes>>>,
        _bottom: Arc<dyn ChainBottom>,
    }

    /// the top of the chain records every message and fails processing for the payload "fail"
    fn setup(config: OrderConfig) -> Setup {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent2 = sent.clone();
        let mut bottom = MockChainBottom::new();
        bottom.expect_send_message()
            .returning(move |destinations, msg| {
                sent2.lock().unwrap().push((destinations, msg));
                Ok(())
            });

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let mut top = MockChainTop::new();
        top.expect_message_received()
            .returning(move |msg| {
                let failing = msg.payload.as_ref() == b"fail";
                received2.lock().unwrap().push(msg.payload);
                if failing {
                    anyhow::bail!("listener failed");
                }
                Ok(())
            });
        top.expect_member_disappeared()
            .returning(|_| ());

        let order = Arc::new(OrderInterceptor::new(config));
        let bottom: Arc<dyn ChainBottom> = Arc::new(bottom);
        let chain = InterceptorChain::new(vec![order.clone() as Arc<dyn ChannelInterceptor>], &bottom, Arc::new(top)).unwrap();
        Setup { chain, order, sent, received, _bottom: bottom }
    }

    fn sequenced(sequence_number: u64, payload: &'static [u8]) -> ChannelMessage {
        let mut buf = BytesMut::new();
        buf.put_u64(sequence_number);
        buf.put_slice(payload);
        ChannelMessage::new(test_member(1), buf.freeze(), SendOptions::USE_ACK)
    }

    /// receives a message that is expected to be held back, returning once it is held
    async fn receive_held(setup: &Setup, sequence_number: u64, payload: &'static [u8]) -> JoinHandle<anyhow::Result<()>> {
        let before = setup.order.held().await;
        let chain = setup.chain.clone();
        let handle = tokio::spawn(async move {
            chain.up().message_received(sequenced(sequence_number, payload)).await
        });
        while setup.order.held().await == before {
            tokio::task::yield_now().await;
        }
        handle
    }

    fn received(setup: &Setup) -> Vec<String> {
        setup.received.lock().unwrap().iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    fn sequence_number(msg: &ChannelMessage) -> u64 {
        msg.payload.clone().get_u64()
    }

    #[tokio::test]
    async fn test_sequence_numbers_per_destination() {
        let setup = setup(Default::default());
        let msg = ChannelMessage::new(test_member(1), Bytes::from_static(b"x"), SendOptions::USE_ACK);

        setup.chain.down().send_message(vec![test_member(2), test_member(3)], msg.clone(), None).await.unwrap();
        setup.chain.down().send_message(vec![test_member(2)], msg.clone(), None).await.unwrap();

        let sent = setup.sent.lock().unwrap();
        let numbers = sent.iter()
            .map(|(d, m)| (d[0].port(), sequence_number(m)))
            .collect::<Vec<_>>();
        assert_eq!(numbers, vec![(2, 0), (3, 0), (2, 1)]);
        assert!(sent.iter().all(|(d, _)| d.len() == 1));
    }

    #[tokio::test]
    async fn test_in_order() {
        let setup = setup(Default::default());
        for (n, p) in [(0, b"a"), (1, b"b"), (2, b"c")] {
            setup.chain.up().message_received(sequenced(n, p)).await.unwrap();
        }
        assert_eq!(received(&setup), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_reordering() {
        let setup = setup(Default::default());
        let c = receive_held(&setup, 2, b"c").await;
        let b = receive_held(&setup, 1, b"b").await;
        assert!(received(&setup).is_empty());
        assert_eq!(setup.order.held().await, 2);
        assert!(!b.is_finished());
        assert!(!c.is_finished());

        setup.chain.up().message_received(sequenced(0, b"a")).await.unwrap();
        assert_eq!(received(&setup), vec!["a", "b", "c"]);
        assert_eq!(setup.order.held().await, 0);
        b.await.unwrap().unwrap();
        c.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_held_message_reports_processing_failure() {
        let setup = setup(Default::default());
        let failing = receive_held(&setup, 1, b"fail").await;
        let ok = receive_held(&setup, 2, b"c").await;

        setup.chain.up().message_received(sequenced(0, b"a")).await.unwrap();
        assert!(failing.await.unwrap().is_err());
        ok.await.unwrap().unwrap();
        assert_eq!(received(&setup), vec!["a", "fail", "c"]);
    }

    #[tokio::test]
    async fn test_held_messages_fail_when_sender_disappears() {
        let setup = setup(Default::default());
        let held = receive_held(&setup, 3, b"d").await;

        setup.chain.up().member_disappeared(&test_member(1)).await;
        assert!(held.await.unwrap().is_err());
        assert_eq!(setup.order.held().await, 0);
        assert!(received(&setup).is_empty());
    }

    #[tokio::test]
    async fn test_senders_are_independent() {
        let setup = setup(Default::default());
        let held = receive_held(&setup, 1, b"b").await;

        // a message from another sender is not blocked by the gap of the first one
        let mut buf = BytesMut::new();
        buf.put_u64(0);
        buf.put_slice(b"other");
        let other = ChannelMessage::new(test_member(2), buf.freeze(), SendOptions::USE_ACK);
        setup.chain.up().message_received(other).await.unwrap();
        assert_eq!(received(&setup), vec!["other"]);

        setup.chain.up().message_received(sequenced(0, b"a")).await.unwrap();
        held.await.unwrap().unwrap();
        assert_eq!(received(&setup), vec!["other", "a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_is_skipped_after_expiry() {
        let setup = setup(OrderConfig { expire: Duration::from_secs(1), ..Default::default() });
        setup.chain.up().message_received(sequenced(0, b"a")).await.unwrap();
        let c = receive_held(&setup, 2, b"c").await;

        setup.order.heartbeat().await;
        assert_eq!(received(&setup), vec!["a"]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        setup.order.heartbeat().await;
        assert_eq!(received(&setup), vec!["a", "c"]);
        c.await.unwrap().unwrap();

        // the missing message arrives late and is rejected
        assert!(setup.chain.up().message_received(sequenced(1, b"b")).await.is_err());
        setup.chain.up().message_received(sequenced(3, b"d")).await.unwrap();
        assert_eq!(received(&setup), vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_gap_is_skipped_when_queue_is_full() {
        let setup = setup(OrderConfig { max_queue: 2, ..Default::default() });
        let b = receive_held(&setup, 1, b"b").await;
        let c = receive_held(&setup, 2, b"c").await;
        assert!(received(&setup).is_empty());

        setup.chain.up().message_received(sequenced(3, b"d")).await.unwrap();
        assert_eq!(received(&setup), vec!["b", "c", "d"]);
        b.await.unwrap().unwrap();
        c.await.unwrap().unwrap();
    }

    #[test]
    fn test_default_queue_is_bounded() {
        assert!(OrderConfig::default().max_queue < 1024);
    }

    #[tokio::test]
    async fn test_missing_sequence_number() {
        let setup = setup(Default::default());
        let msg = ChannelMessage::new(test_member(1), Bytes::from_static(b"abc"), SendOptions::USE_ACK);
        assert!(setup.chain.up().message_received(msg).await.is_err());
    }
}
