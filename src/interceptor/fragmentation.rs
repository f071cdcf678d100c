use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel::error::ChannelError;
use crate::channel::listener::ErrorHandler;
use crate::channel::services::ServiceSet;
use crate::interceptor::channel_interceptor::{ChannelInterceptor, DownChain, SendOutcome, UpChain};
use crate::membership::member::Member;
use crate::messaging::channel_message::{ChannelMessage, UniqueId};
use crate::util::buf::try_get_array;

const WHOLE: u8 = 0;
const FRAGMENT: u8 = 1;

#[derive(Debug, Clone)]
pub struct FragmentationConfig {
    /// payloads larger than this are split into fragments of at most this size
    pub max_size: usize,
    /// incomplete messages older than this are discarded on heartbeat
    pub expire: Duration,
    /// messages with more fragments than this are neither sent nor reassembled
    pub max_fragments: u32,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        FragmentationConfig {
            max_size: 1024 * 1024,
            expire: Duration::from_secs(60),
            max_fragments: 1024,
        }
    }
}

impl FragmentationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_size == 0 {
            bail!("max fragment size must be positive");
        }
        if self.max_fragments == 0 {
            bail!("max number of fragments must be positive");
        }
        Ok(())
    }
}

struct FragmentHeader {
    original_id: UniqueId,
    index: u32,
    total: u32,
}

impl FragmentHeader {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(FRAGMENT);
        buf.put_slice(&self.original_id.0);
        buf.put_u32(self.index);
        buf.put_u32(self.total);
    }
}

/// a partially received message
struct Reassembly {
    fragments: Vec<Option<Bytes>>,
    missing: usize,
    started: Instant,
}

/// Splits large messages into fragments on the way down, and reassembles them on the way up.
///  The original message is delivered once all of its fragments arrived.
///
/// Every message gets a one-byte marker, so all members of a group must use this interceptor
///  if any of them does.
pub struct FragmentationInterceptor {
    config: FragmentationConfig,
    reassemblies: Mutex<FxHashMap<UniqueId, Reassembly>>,
}

impl FragmentationInterceptor {
    pub fn new(config: FragmentationConfig) -> FragmentationInterceptor {
        FragmentationInterceptor {
            config,
            reassemblies: Default::default(),
        }
    }

    /// number of messages that are partially received
    pub fn incomplete(&self) -> usize {
        self.reassemblies.lock().unwrap().len()
    }

    fn fragment(&self, msg: &ChannelMessage) -> Vec<ChannelMessage> {
        let chunks = msg.payload.chunks(self.config.max_size).collect::<Vec<_>>();
        let total = chunks.len() as u32;

        chunks.into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let header = FragmentHeader { original_id: msg.unique_id, index: index as u32, total };
                let mut buf = BytesMut::with_capacity(chunk.len() + 25);
                header.ser(&mut buf);
                buf.put_slice(chunk);
                msg.with_payload(buf.freeze())
                    .with_unique_id(UniqueId::new_for(&msg.address))
            })
            .collect()
    }

    /// adds a fragment, returning the original payload if it is complete
    fn add_fragment(&self, header: FragmentHeader, chunk: Bytes) -> anyhow::Result<Option<Bytes>> {
        if header.total == 0 || header.index >= header.total {
            bail!("invalid fragment {} of {}", header.index, header.total);
        }
        if header.total > self.config.max_fragments {
            bail!("message {:?} has {} fragments, the limit is {}", header.original_id, header.total, self.config.max_fragments);
        }
        // all fragments but the last one are filled completely
        let is_last = header.index + 1 == header.total;
        if chunk.is_empty() || chunk.len() > self.config.max_size || (!is_last && chunk.len() != self.config.max_size) {
            bail!("fragment {} of {} has an invalid size of {} bytes", header.index, header.total, chunk.len());
        }

        let mut reassemblies = self.reassemblies.lock().unwrap();
        let reassembly = reassemblies.entry(header.original_id)
            .or_insert_with(|| Reassembly {
                fragments: vec![None; header.total as usize],
                missing: header.total as usize,
                started: Instant::now(),
            });
        if reassembly.fragments.len() != header.total as usize {
            bail!("fragment count mismatch for {:?}", header.original_id);
        }

        let slot = &mut reassembly.fragments[header.index as usize];
        if slot.is_none() {
            *slot = Some(chunk);
            reassembly.missing -= 1;
        }
        if reassembly.missing > 0 {
            return Ok(None);
        }

        let Some(reassembly) = reassemblies.remove(&header.original_id) else {
            return Ok(None);
        };
        let mut payload = BytesMut::new();
        for fragment in reassembly.fragments.into_iter().flatten() {
            payload.put_slice(&fragment);
        }
        Ok(Some(payload.freeze()))
    }
}

#[async_trait]
impl ChannelInterceptor for FragmentationInterceptor {
    fn name(&self) -> &str {
        "FragmentationInterceptor"
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>, next: DownChain) -> Result<SendOutcome, ChannelError> {
        if msg.payload.len() <= self.config.max_size {
            let mut buf = BytesMut::with_capacity(msg.payload.len() + 1);
            buf.put_u8(WHOLE);
            buf.put_slice(&msg.payload);
            return next.send_message(destinations, msg.with_payload(buf.freeze()), handler).await;
        }

        let fragments = self.fragment(&msg);
        if fragments.len() > self.config.max_fragments as usize {
            return Err(ChannelError::Other(anyhow::anyhow!("message of {} bytes exceeds the limit of {} fragments", msg.payload.len(), self.config.max_fragments)));
        }
        debug!(id = ?msg.unique_id, "sending message as {} fragments", fragments.len());

        let mut outcome = SendOutcome::Sent;
        for fragment in fragments {
            if next.clone().send_message(destinations.clone(), fragment, handler.clone()).await? == SendOutcome::Queued {
                outcome = SendOutcome::Queued;
            }
        }
        Ok(outcome)
    }

    async fn message_received(&self, msg: ChannelMessage, next: UpChain) -> anyhow::Result<()> {
        let mut buf = msg.payload.clone();
        match buf.try_get_u8()? {
            WHOLE => next.message_received(msg.with_payload(buf)).await,
            FRAGMENT => {
                let header = FragmentHeader {
                    original_id: UniqueId(try_get_array(&mut buf)?),
                    index: buf.try_get_u32()?,
                    total: buf.try_get_u32()?,
                };
                let original_id = header.original_id;
                trace!(id = ?original_id, "received fragment {} of {}", header.index, header.total);

                match self.add_fragment(header, buf)? {
                    Some(payload) => {
                        let original = msg.with_payload(payload).with_unique_id(original_id);
                        next.message_received(original).await
                    }
                    None => Ok(()),
                }
            }
            other => bail!("invalid fragmentation marker {}", other),
        }
    }

    async fn start(&self, _svc: ServiceSet) -> Result<(), ChannelError> {
        self.config.validate()
            .map_err(|e| ChannelError::Config(e.to_string()))
    }

    async fn heartbeat(&self) {
        let now = Instant::now();
        self.reassemblies.lock().unwrap()
            .retain(|id, r| {
                let keep = now.duration_since(r.started) <= self.config.expire;
                if !keep {
                    debug!(?id, "discarding incomplete message, {} fragments are missing", r.missing);
                }
                keep
            });
    }
}
