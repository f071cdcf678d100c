use std::time::Duration;

use anyhow::bail;

use crate::transport::bind::StreamOptions;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// The maximum time to wait for an ack, for messages that require one. Exceeding it is
    ///  reported as an ack timeout, which is distinct from the receiver rejecting the message.
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,

    /// Number of times a send is retried after an I/O error, with a new connection. Ack timeouts
    ///  and rejections are never retried.
    pub max_retry_attempts: u32,

    pub rx_buf_size: usize,
    pub tx_buf_size: usize,
    pub udp_tx_buf_size: usize,

    pub tcp_no_delay: bool,
    pub so_keep_alive: bool,
    pub oob_inline: bool,
    pub so_linger_on: bool,
    pub so_linger_time: Duration,
    pub so_traffic_class: u32,

    /// messages longer than this are rejected without being sent
    pub max_frame_size: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            ack_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
            max_retry_attempts: 1,
            rx_buf_size: 25188,
            tx_buf_size: 43800,
            udp_tx_buf_size: 43800,
            tcp_no_delay: true,
            so_keep_alive: false,
            oob_inline: true,
            so_linger_on: true,
            so_linger_time: Duration::from_secs(3),
            so_traffic_class: 0x1C,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            bail!("max_frame_size must be between 1 and {}", u32::MAX);
        }
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            tcp_no_delay: self.tcp_no_delay,
            so_keep_alive: self.so_keep_alive,
            oob_inline: self.oob_inline,
            rx_buf_size: self.rx_buf_size,
            tx_buf_size: self.tx_buf_size,
            so_linger: self.so_linger_on.then_some(self.so_linger_time),
            so_traffic_class: self.so_traffic_class,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(SenderConfig::default().validate().is_ok());

        let config = SenderConfig {
            ack_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SenderConfig {
            max_frame_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stream_options() {
        let config = SenderConfig {
            so_linger_on: false,
            ..Default::default()
        };
        assert_eq!(config.stream_options().so_linger, None);
        assert_eq!(SenderConfig::default().stream_options().so_linger, Some(Duration::from_secs(3)));
    }
}
