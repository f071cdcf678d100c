use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use anyhow::{anyhow, bail};

use crate::transport::bind::StreamOptions;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// The address to listen on, and to advertise to other members. `None` means 'auto', i.e.
    ///  the address of the interface that has the default route.
    pub host: Option<IpAddr>,

    /// the first TCP port to try
    pub port: u16,

    /// Number of ports to try (starting at `port`) until binding succeeds. Zero is treated as
    ///  one.
    pub auto_bind: u32,

    /// If this is set, a UDP socket is bound as well (with the same auto-bind logic), and members
    ///  can send messages with the UDP option to it
    pub udp_port: Option<u16>,

    /// This port is only advertised to other members, the receiver does not listen on it
    pub secure_port: Option<u16>,

    pub rx_buf_size: usize,
    pub tx_buf_size: usize,
    pub udp_rx_buf_size: usize,
    pub udp_tx_buf_size: usize,

    pub tcp_no_delay: bool,
    pub so_keep_alive: bool,
    pub oob_inline: bool,
    pub so_reuse_address: bool,
    pub so_linger_on: bool,
    pub so_linger_time: Duration,
    pub so_traffic_class: u32,

    /// Once the first byte of a frame arrived, the rest of the frame must arrive within this
    ///  time, otherwise the connection is closed
    pub timeout: Duration,

    /// the interval in which the accept loop wakes up to check if it was stopped
    pub selector_timeout: Duration,

    pub min_threads: usize,
    pub max_threads: usize,
    pub min_tasks: usize,
    pub max_tasks: usize,
    /// the time after which worker tasks in excess of `min_threads` are discarded when idle
    pub max_idle_time: Duration,

    /// frames longer than this are rejected and cause the connection to be closed
    pub max_frame_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            host: None,
            port: 4000,
            auto_bind: 100,
            udp_port: None,
            secure_port: None,
            rx_buf_size: 25188,
            tx_buf_size: 43800,
            udp_rx_buf_size: 25188,
            udp_tx_buf_size: 43800,
            tcp_no_delay: true,
            so_keep_alive: false,
            oob_inline: true,
            so_reuse_address: true,
            so_linger_on: true,
            so_linger_time: Duration::from_secs(3),
            so_traffic_class: 0x04 | 0x08 | 0x10,
            timeout: Duration::from_secs(3),
            selector_timeout: Duration::from_secs(5),
            min_threads: 6,
            max_threads: 15,
            min_tasks: 10,
            max_tasks: 100,
            max_idle_time: Duration::from_secs(60),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl ReceiverConfig {
    /// a config for the loopback interface, starting at the given port
    pub fn localhost(port: u16) -> ReceiverConfig {
        ReceiverConfig {
            host: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_threads == 0 {
            bail!("max_threads must be positive");
        }
        if self.min_threads > self.max_threads {
            bail!("min_threads ({}) must not be greater than max_threads ({})", self.min_threads, self.max_threads);
        }
        if self.max_tasks == 0 {
            bail!("max_tasks must be positive");
        }
        if self.min_tasks > self.max_tasks {
            bail!("min_tasks ({}) must not be greater than max_tasks ({})", self.min_tasks, self.max_tasks);
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

    pub fn resolve_host(&self) -> anyhow::Result<IpAddr> {
        match self.host {
            Some(host) => Ok(host),
            None => auto_host(),
        }
    }
}

/// The 'auto' host is the local address of the interface that would be used to reach a public
///  address. No packet is sent: connecting a UDP socket only selects a route.
fn auto_host() -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
    socket.connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9))
        .map_err(|e| anyhow!("unable to resolve 'auto' host address: {}", e))?;
    let local = socket.local_addr()?.ip();
    if local.is_unspecified() {
        bail!("unable to resolve 'auto' host address");
    }
    Ok(local)
}
