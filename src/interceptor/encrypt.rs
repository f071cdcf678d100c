use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aead::{AeadCore, AeadInPlace, Key, KeyInit, Nonce, OsRng};
use aes_gcm::Aes256Gcm;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::channel::error::ChannelError;
use crate::channel::listener::ErrorHandler;
use crate::channel::send_options::SendOptions;
use crate::interceptor::channel_interceptor::{ChannelInterceptor, DownChain, SendOutcome, UpChain};
use crate::membership::member::Member;
use crate::messaging::channel_message::ChannelMessage;

const NONCE_LEN: usize = 12;

/// Encrypts the payload of messages with the [SendOptions::SECURE] option using AES-256-GCM.
///  The key is derived from a passphrase that all members of the group share.
///
/// A message that can not be decrypted is dropped.
pub struct EncryptInterceptor {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl EncryptInterceptor {
    pub fn new(passphrase: &str) -> EncryptInterceptor {
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut nonce_buf = nonce.as_slice();
        let nonce_fixed = nonce_buf.get_u32();
        let nonce_incremented = AtomicU64::new(nonce_buf.get_u64());

        EncryptInterceptor {
            cipher,
            nonce_fixed,
            nonce_incremented,
        }
    }

    fn unique_nonce(&self) -> Nonce<Aes256Gcm> {
        let mut buf = Vec::with_capacity(NONCE_LEN);
        buf.extend_from_slice(&self.nonce_fixed.to_le_bytes());
        buf.extend_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_le_bytes());
        Nonce::<Aes256Gcm>::clone_from_slice(&buf)
    }

    fn encrypt(&self, payload: &[u8]) -> anyhow::Result<BytesMut> {
        let nonce = self.unique_nonce();
        let mut buf = BytesMut::with_capacity(payload.len() + 16 + NONCE_LEN);
        buf.extend_from_slice(payload);
        self.cipher.encrypt_in_place(&nonce, b"", &mut buf)
            .map_err(|_| anyhow!("error encrypting payload"))?;
        buf.extend_from_slice(nonce.as_slice());
        Ok(buf)
    }

    fn decrypt(&self, payload: &[u8]) -> anyhow::Result<BytesMut> {
        if payload.len() < NONCE_LEN {
            bail!("encrypted payload is too short");
        }
        let (cipher_text, nonce) = payload.split_at(payload.len() - NONCE_LEN);
        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(nonce);

        let mut buf = BytesMut::from(cipher_text);
        self.cipher.decrypt_in_place(&nonce, b"", &mut buf)
            .map_err(|_| anyhow!("decryption error"))?;
        Ok(buf)
    }
}

#[async_trait]
impl ChannelInterceptor for EncryptInterceptor {
    fn name(&self) -> &str {
        "EncryptInterceptor"
    }

    fn option_flag(&self) -> SendOptions {
        SendOptions::SECURE
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage, handler: Option<Arc<dyn ErrorHandler>>, next: DownChain) -> Result<SendOutcome, ChannelError> {
        let encrypted = self.encrypt(&msg.payload)?;
        trace!(id = ?msg.unique_id, "encrypted payload of {} bytes", msg.payload.len());
        next.send_message(destinations, msg.with_payload(encrypted.freeze()), handler).await
    }

    async fn message_received(&self, msg: ChannelMessage, next: UpChain) -> anyhow::Result<()> {
        match self.decrypt(&msg.payload) {
            Ok(decrypted) => next.message_received(msg.with_payload(decrypted.freeze())).await,
            Err(e) => {
                warn!(id = ?msg.unique_id, from = %msg.address, "dropping message: {}", e);
                Err(e.context(format!("unable to decrypt message {}", msg.unique_id)))
            }
        }
    }
}
