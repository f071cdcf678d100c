use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, info, trace};

use crate::channel::error::{collect_failures, ChannelError, FaultyMember, SendFailure};
use crate::channel::send_options::SendOptions;
use crate::membership::member::Member;
use crate::messaging::channel_message::{ChannelMessage, UniqueId};
use crate::messaging::frame::Frame;
use crate::transport::bind::{apply_stream_options, bind_udp_socket, StreamOptions};
use crate::transport::sender_config::SenderConfig;

/// acks are tiny, anything bigger than this is not an ack
const MAX_ACK_FRAME_SIZE: usize = 1024;

/// The sending side of the replication transport
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelSender: Send + Sync + 'static {
    async fn start(&self) -> Result<(), ChannelError>;
    async fn stop(&self) -> Result<(), ChannelError>;
    fn is_started(&self) -> bool;

    /// Sends a message to all destinations in parallel. Every destination is attempted, and if
    ///  any of them fail, the returned error has an entry for every failed destination.
    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage) -> Result<(), ChannelError>;

    async fn heartbeat(&self) {}
}

/// Sends each message over a new TCP connection (or as a UDP datagram for messages with the
///  `UDP` option), waiting for the receiver's ack on that connection if the message requires
///  one.
pub struct ReplicationSender {
    config: Arc<SenderConfig>,
    udp_sockets: RwLock<Option<Arc<UdpSockets>>>,
}

struct UdpSockets {
    ipv4: UdpSocket,
    ipv6: Option<UdpSocket>,
}

impl UdpSockets {
    fn bind(config: &SenderConfig) -> std::io::Result<UdpSockets> {
        let ipv4 = bind_udp_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), config.rx_buf_size, config.udp_tx_buf_size)?;
        // hosts without IPv6 support are common enough to make this optional
        let ipv6 = bind_udp_socket(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0), config.rx_buf_size, config.udp_tx_buf_size)
            .map_err(|e| debug!("no IPv6 socket for sending datagrams: {}", e))
            .ok();
        Ok(UdpSockets { ipv4, ipv6 })
    }

    fn for_addr(&self, addr: &SocketAddr) -> Option<&UdpSocket> {
        match addr {
            SocketAddr::V4(_) => Some(&self.ipv4),
            SocketAddr::V6(_) => self.ipv6.as_ref(),
        }
    }
}

impl ReplicationSender {
    pub fn new(config: SenderConfig) -> ReplicationSender {
        ReplicationSender {
            config: Arc::new(config),
            udp_sockets: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }
}

#[async_trait]
impl ChannelSender for ReplicationSender {
    async fn start(&self) -> Result<(), ChannelError> {
        if self.is_started() {
            return Err(ChannelError::IllegalState("sender is already started".to_string()));
        }
        self.config.validate()
            .map_err(|e| ChannelError::Config(e.to_string()))?;

        let sockets = UdpSockets::bind(&self.config)
            .map_err(anyhow::Error::from)?;
        *self.udp_sockets.write().unwrap() = Some(Arc::new(sockets));
        info!("replication sender started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        match self.udp_sockets.write().unwrap().take() {
            Some(_) => {
                debug!("replication sender stopped");
                Ok(())
            }
            None => Err(ChannelError::IllegalState("sender is not started".to_string())),
        }
    }

    fn is_started(&self) -> bool {
        self.udp_sockets.read().unwrap().is_some()
    }

    async fn send_message(&self, destinations: Vec<Member>, msg: ChannelMessage) -> Result<(), ChannelError> {
        let udp_sockets = self.udp_sockets.read().unwrap().clone()
            .ok_or_else(|| ChannelError::IllegalState("sender is not started".to_string()))?;
        if destinations.is_empty() {
            return Err(ChannelError::NoDestination);
        }

        let use_udp = msg.options.contains(SendOptions::UDP);
        let mut buf = BytesMut::new();
        if use_udp {
            Frame::Data(msg.clone()).ser(&mut buf);
        }
        else {
            Frame::Data(msg.clone()).ser_length_prefixed(&mut buf);
        }
        if buf.len() > self.config.max_frame_size {
            return Err(anyhow!("message {:?} has {} bytes, exceeding the maximum frame size of {}", msg.unique_id, buf.len(), self.config.max_frame_size).into());
        }
        let frame = buf.freeze();

        let mut sends = JoinSet::new();
        for member in destinations {
            let frame = frame.clone();
            let config = self.config.clone();
            let udp_sockets = udp_sockets.clone();
            let options = msg.options;
            let id = msg.unique_id;
            sends.spawn(async move {
                let result = if use_udp {
                    send_udp(&udp_sockets, &member, &frame).await
                }
                else {
                    send_tcp(&config, &member, &frame, id, options).await
                };
                (member, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((member, Err(cause))) => {
                    debug!("sending message {:?} to {} failed: {}", msg.unique_id, member, cause);
                    failures.push(FaultyMember { member, cause });
                }
                Err(e) => return Err(anyhow!("send task failed: {}", e).into()),
            }
        }
        collect_failures(failures)
    }
}

async fn send_udp(sockets: &UdpSockets, member: &Member, frame: &Bytes) -> Result<(), SendFailure> {
    let addr = member.udp_addr()
        .ok_or(SendFailure::NoUdpPort)?;
    let socket = sockets.for_addr(&addr)
        .ok_or_else(|| SendFailure::Other(anyhow!("no socket for sending to {}", addr)))?;
    socket.send_to(frame, addr).await?;
    Ok(())
}

async fn send_tcp(config: &SenderConfig, member: &Member, frame: &Bytes, id: UniqueId, options: SendOptions) -> Result<(), SendFailure> {
    let stream_options = config.stream_options();
    let mut attempt = 0;
    loop {
        match send_tcp_once(config, &stream_options, member.socket_addr(), frame, id, options).await {
            Err(SendFailure::Io(e)) if attempt < config.max_retry_attempts => {
                attempt += 1;
                debug!("I/O error sending to {}: {} - retrying ({}/{})", member, e, attempt, config.max_retry_attempts);
            }
            result => return result,
        }
    }
}

async fn send_tcp_once(config: &SenderConfig, stream_options: &StreamOptions, addr: SocketAddr, frame: &[u8], id: UniqueId, options: SendOptions) -> Result<(), SendFailure> {
    let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await
        .map_err(|_| std::io::Error::new(ErrorKind::TimedOut, format!("connecting to {} timed out", addr)))??;
    apply_stream_options(&stream, stream_options)?;

    stream.write_all(frame).await?;
    stream.flush().await?;
    trace!(?id, "message written to {}", addr);

    if options.requires_ack() {
        match tokio::time::timeout(config.ack_timeout, read_ack(&mut stream)).await {
            Err(_) => return Err(SendFailure::AckTimeout(config.ack_timeout)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Frame::Ack(ack_id))) if ack_id == id => trace!(?id, "ack received"),
            Ok(Ok(Frame::FailAck(ack_id))) if ack_id == id => return Err(SendFailure::AckRejected(id)),
            Ok(Ok(other)) => return Err(SendFailure::Other(anyhow!("expected an ack for {:?}, received {:?}", id, other))),
        }
    }

    // the message was delivered at this point
    if let Err(e) = stream.shutdown().await {
        trace!("error closing connection to {}: {}", addr, e);
    }
    Ok(())
}

async fn read_ack(stream: &mut TcpStream) -> Result<Frame, SendFailure> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_ACK_FRAME_SIZE {
        return Err(SendFailure::Other(anyhow!("ack frame of {} bytes is too long", len)));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Frame::try_deser(&buf)
        .map_err(SendFailure::Other)
}
