use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

use crate::channel::error::ChannelError;
use crate::transport::receiver_config::ReceiverConfig;

/// Binding and port probing is serialized process-wide so that two channels in the same process
///  do not race for the same port
static BIND_LOCK: Mutex<()> = Mutex::new(());

const UDP_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Tries to bind to `start_port`, `start_port + 1`, ... until binding succeeds or `retries`
///  attempts were made (at least one attempt is always made). Returns the bound resource and its
///  port, or an error naming the last address that was tried.
pub fn bind_with_retry<T>(host: IpAddr, start_port: u16, retries: u32, mut bind_fn: impl FnMut(SocketAddr) -> std::io::Result<T>) -> Result<(T, u16), ChannelError> {
    let _lock = BIND_LOCK.lock().unwrap();

    let attempts = retries.max(1);
    let mut port = start_port;
    let mut attempt = 0;
    loop {
        let addr = SocketAddr::new(host, port);
        attempt += 1;
        match bind_fn(addr) {
            Ok(bound) => return Ok((bound, port)),
            Err(source) => {
                if attempt >= attempts || port == u16::MAX {
                    return Err(ChannelError::Bind { addr, attempts: attempt, source });
                }
                debug!("unable to bind to {}: {} - trying next port", addr, source);
                port += 1;
            }
        }
    }
}

/// Same as [bind_with_retry], but pausing briefly between attempts. This is used for UDP where
///  a port is often released with a small delay.
pub async fn bind_with_retry_delayed<T>(host: IpAddr, start_port: u16, retries: u32, mut bind_fn: impl FnMut(SocketAddr) -> std::io::Result<T>) -> Result<(T, u16), ChannelError> {
    let attempts = retries.max(1);
    let mut port = start_port;
    let mut attempt = 0;
    loop {
        let addr = SocketAddr::new(host, port);
        attempt += 1;
        match bind_fn(addr) {
            Ok(bound) => return Ok((bound, port)),
            Err(source) => {
                if attempt >= attempts || port == u16::MAX {
                    return Err(ChannelError::Bind { addr, attempts: attempt, source });
                }
                debug!("unable to bind UDP socket to {}: {} - trying next port", addr, source);
                port += 1;
                tokio::time::sleep(UDP_RETRY_DELAY).await;
            }
        }
    }
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 }
}

/// creates a listening TCP socket with the configured options
pub fn bind_tcp_listener(addr: SocketAddr, config: &ReceiverConfig) -> std::io::Result<tokio::net::TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(config.so_reuse_address)?;
    socket.set_recv_buffer_size(config.rx_buf_size)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(socket.into())
}

pub fn bind_udp_socket(addr: SocketAddr, rx_buf_size: usize, tx_buf_size: usize) -> std::io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(rx_buf_size)?;
    socket.set_send_buffer_size(tx_buf_size)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(socket.into())
}

/// Options for connected TCP streams, shared by the receiving and the sending side
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub tcp_no_delay: bool,
    pub so_keep_alive: bool,
    pub oob_inline: bool,
    pub rx_buf_size: usize,
    pub tx_buf_size: usize,
    pub so_linger: Option<Duration>,
    pub so_traffic_class: u32,
}

pub fn apply_stream_options(stream: &tokio::net::TcpStream, options: &StreamOptions) -> std::io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(options.tcp_no_delay)?;
    socket.set_keepalive(options.so_keep_alive)?;
    socket.set_out_of_band_inline(options.oob_inline)?;
    socket.set_recv_buffer_size(options.rx_buf_size)?;
    socket.set_send_buffer_size(options.tx_buf_size)?;
    socket.set_linger(options.so_linger)?;

    if stream.local_addr()?.is_ipv4() {
        // traffic class is advisory, some platforms refuse it for unprivileged processes
        if let Err(e) = socket.set_tos(options.so_traffic_class) {
            debug!("unable to set traffic class on {:?}: {}", stream.peer_addr(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::net::Ipv4Addr;

    use rstest::rstest;
    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// a bind function that fails for the first `num_failures` calls, recording the ports
    fn failing(num_failures: usize, tried: &mut Vec<u16>) -> impl FnMut(SocketAddr) -> std::io::Result<u16> + '_ {
        move |addr| {
            tried.push(addr.port());
            if tried.len() <= num_failures {
                Err(std::io::Error::new(ErrorKind::AddrInUse, "in use"))
            }
            else {
                Ok(addr.port())
            }
        }
    }

    #[rstest]
    #[case::first_attempt(0, 10, 4000, vec![4000])]
    #[case::third_attempt(2, 10, 4000, vec![4000, 4001, 4002])]
    #[case::last_attempt(4, 5, 4000, vec![4000, 4001, 4002, 4003, 4004])]
    #[case::zero_retries_means_one(0, 0, 4000, vec![4000])]
    fn test_bind_success(#[case] num_failures: usize, #[case] retries: u32, #[case] start_port: u16, #[case] expected_tried: Vec<u16>) {
        let mut tried = Vec::new();
        let (bound, port) = bind_with_retry(LOCALHOST, start_port, retries, failing(num_failures, &mut tried)).unwrap();
        assert_eq!(bound, port);
        assert_eq!(port, *expected_tried.last().unwrap());
        assert_eq!(tried, expected_tried);
    }

    #[rstest]
    #[case::one(1, 4000, 1, 4000)]
    #[case::five(5, 4000, 5, 4004)]
    #[case::zero(0, 4000, 1, 4000)]
    #[case::port_range_end(10, 65534, 2, 65535)]
    fn test_bind_exhausted(#[case] retries: u32, #[case] start_port: u16, #[case] expected_attempts: u32, #[case] expected_last_port: u16) {
        let mut tried = Vec::new();
        match bind_with_retry(LOCALHOST, start_port, retries, failing(usize::MAX, &mut tried)) {
            Err(ChannelError::Bind { addr, attempts, .. }) => {
                assert_eq!(attempts, expected_attempts);
                assert_eq!(addr, SocketAddr::new(LOCALHOST, expected_last_port));
            }
            other => panic!("unexpected result {:?}", other.map(|(_, p)| p)),
        }
        assert_eq!(tried.len() as u32, expected_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_delayed() {
        let mut tried = Vec::new();
        let start = tokio::time::Instant::now();
        let (_, port) = bind_with_retry_delayed(LOCALHOST, 5000, 3, failing(2, &mut tried)).await.unwrap();
        assert_eq!(port, 5002);
        assert_eq!(start.elapsed(), 2 * UDP_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_delayed_exhausted() {
        let mut tried = Vec::new();
        let result = bind_with_retry_delayed(LOCALHOST, 5000, 3, failing(usize::MAX, &mut tried)).await;
        assert!(matches!(result, Err(ChannelError::Bind { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_bind_tcp_port_in_use() {
        let config = ReceiverConfig::default();
        let (first, port) = bind_with_retry(LOCALHOST, 0, 1, |addr| bind_tcp_listener(addr, &config)).unwrap();
        let actual_port = first.local_addr().unwrap().port();
        assert_eq!(port, 0);

        let (second, second_port) = bind_with_retry(LOCALHOST, actual_port, 5, |addr| bind_tcp_listener(addr, &config)).unwrap();
        assert_ne!(second_port, actual_port);
        assert_eq!(second.local_addr().unwrap().port(), second_port);
    }
}
