use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::channel::error::ChannelError;
use crate::channel::listener::ErrorHandler;
use crate::interceptor::channel_interceptor::{ChannelInterceptor, DownChain, SendOutcome, UpChain};
use crate::membership::member::Member;
use crate::messaging::channel_message::ChannelMessage;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ThroughputReport {
    pub msg_tx: u64,
    pub bytes_tx: u64,
    pub msg_tx_err: u64,
    pub msg_rx: u64,
    pub bytes_rx: u64,
    /// time spent in sending, accumulated over all sent messages
    pub time_in_tx: Duration,
}

/// Counts messages and bytes passing through, logging a summary every `interval` messages
///  (sent and received separately).
pub struct ThroughputInterceptor {
    interval: u64,
    msg_tx: AtomicU64,
    bytes_tx: AtomicU64,
    msg_tx_err: AtomicU64,
    msg_rx: AtomicU64,
    bytes_rx: AtomicU64,
    nanos_in_tx: AtomicU64,
    started: Mutex<Option<Instant>>,
}

impl ThroughputInterceptor {
    pub fn new(interval: u64) -> ThroughputInterceptor {
        ThroughputInterceptor {
            interval: interval.max(1),
            msg_tx: Default::default(),
            bytes_tx: Default::default(),
            msg_tx_err: Default::default(),
            msg_rx: Default::default(),
            bytes_rx: Default::default(),
            nanos_in_tx: Default::default(),
            started: Mutex::new(None),
        }
    }

    pub fn report(&self) -> ThroughputReport {
        ThroughputReport {
            msg_tx: self.msg_tx.load(Ordering::Acquire),
            bytes_tx: self.bytes_tx.load(Ordering::Acquire),
            msg_tx_err: self.msg_tx_err.load(Ordering::Acquire),
            msg_rx: self.msg_rx.load(Ordering::Acquire),
            bytes_rx: self.bytes_rx.load(Ordering::Acquire),
            time_in_tx: Duration::from_nanos(self.nanos_in_tx.load(Ordering::Acquire)),
        }
    }

    fn log_report(&self, direction: &str) {
        let report = self.report();
        let elapsed = self.started.lock().unwrap()
            .map(|s| s.elapsed())
            .unwrap_or_default();
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            "throughput ({}) after {:?}: tx {} msgs / {} bytes ({} errors, {:.1} msg/s), rx {} msgs / {} bytes ({:.1} msg/s)",
            direction, elapsed,
            report.msg_tx, report.bytes_tx, report.msg_tx_err, report.msg_tx as f64 / secs,
            report.msg_rx, report.bytes_rx, report.msg_rx as f64 / secs,
        );
    }

    fn mark_started(&self) {
        self.started.lock().unwrap().get_or_insert_with(Instant::now);
    }
}

#[async_trait]
impl ChannelInterceptor for ThroughputInterceptor {
    fn name(&self) -> &str {
        "ThroughputInterceptor"
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>, next: DownChain) -> Result<SendOutcome, ChannelError> {
        self.mark_started();
        let size = msg.payload.len() as u64;
        let start = Instant::now();

        let result = next.send_message(destinations, msg, handler).await;

        self.nanos_in_tx.fetch_add(start.elapsed().as_nanos() as u64, Ordering::AcqRel);
        if result.is_err() {
            self.msg_tx_err.fetch_add(1, Ordering::AcqRel);
        }
        self.bytes_tx.fetch_add(size, Ordering::AcqRel);
        let count = self.msg_tx.fetch_add(1, Ordering::AcqRel) + 1;
        if count % self.interval == 0 {
            self.log_report("tx");
        }
        result
    }

    async fn message_received(&self, msg: ChannelMessage, next: UpChain) -> anyhow::Result<()> {
        self.mark_started();
        self.bytes_rx.fetch_add(msg.payload.len() as u64, Ordering::AcqRel);
        let count = self.msg_rx.fetch_add(1, Ordering::AcqRel) + 1;
        if count % self.interval == 0 {
            self.log_report("rx");
        }
        next.message_received(msg).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::channel::send_options::SendOptions;
    use crate::interceptor::channel_interceptor::{ChainBottom, InterceptorChain, MockChainBottom, MockChainTop};
    use crate::test_util::member::test_member;
    use super::*;

    #[tokio::test]
    async fn test_counters() {
        let mut bottom = MockChainBottom::new();
        let mut calls = 0;
        bottom.expect_send_message()
            .returning(move |_, _| {
                calls += 1;
                if calls == 2 { Err(ChannelError::NoDestination) } else { Ok(()) }
            });
        let mut top = MockChainTop::new();
        top.expect_message_received().returning(|_| Ok(()));

        let throughput = Arc::new(ThroughputInterceptor::new(2));
        let bottom: Arc<dyn ChainBottom> = Arc::new(bottom);
        let chain = InterceptorChain::new(vec![throughput.clone() as Arc<dyn ChannelInterceptor>], &bottom, Arc::new(top)).unwrap();

        let msg = ChannelMessage::new(test_member(1), Bytes::from_static(b"abcd"), SendOptions::USE_ACK);
        for _ in 0..3 {
            let _ = chain.down().send_message(vec![test_member(2)], msg.clone(), None).await;
        }
        chain.up().message_received(msg.clone()).await.unwrap();

        let report = throughput.report();
        assert_eq!(report.msg_tx, 3);
        assert_eq!(report.bytes_tx, 12);
        assert_eq!(report.msg_tx_err, 1);
        assert_eq!(report.msg_rx, 1);
        assert_eq!(report.bytes_rx, 4);
    }
}
