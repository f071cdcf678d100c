use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, trace, warn, Instrument, Span};

use crate::channel::error::ChannelError;
use crate::channel::send_options::SendOptions;
use crate::messaging::channel_message::ChannelMessage;
use crate::messaging::frame::Frame;
use crate::messaging::MessageListener;
use crate::transport::bind::{apply_stream_options, bind_tcp_listener, bind_udp_socket, bind_with_retry, bind_with_retry_delayed};
use crate::transport::receiver_config::ReceiverConfig;
use crate::transport::task_pool::RxTaskPool;
use crate::transport::worker_pool::WorkerPool;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// The receiving side of the replication transport
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelReceiver: Send + Sync + 'static {
    /// must be called before the receiver is started
    fn set_message_listener(&self, listener: Arc<dyn MessageListener>);

    async fn start(&self) -> Result<(), ChannelError>;
    async fn stop(&self) -> Result<(), ChannelError>;

    fn is_started(&self) -> bool;

    /// the address the receiver is bound to, `None` if it is not started
    fn host(&self) -> Option<IpAddr>;
    fn port(&self) -> Option<u16>;
    fn udp_port(&self) -> Option<u16>;
    /// the configured secure port, advertised to other members but not bound by this receiver
    fn secure_port(&self) -> Option<u16>;

    async fn heartbeat(&self) {}
}

/// the reusable state for receiving a single frame
pub struct ReceiveTask {
    buf: BytesMut,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReceiverStats {
    pub pool_size: usize,
    pub active_count: usize,
    pub task_count: u64,
    pub completed_task_count: u64,
    pub outstanding_tasks: usize,
}

/// Listens for TCP connections (and optionally UDP datagrams) from other members, and hands
///  received messages to a worker pool for delivery to the [MessageListener].
///
/// Acks are sent back over the connection a message arrived on: for `USE_ACK` as soon as the
///  message was read, for `SYNCHRONIZED_ACK` after the listener processed it (or a failed ack if
///  it did not accept the message or failed to process it). Datagrams are never acknowledged.
pub struct ReplicationReceiver {
    config: ReceiverConfig,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    running: Mutex<Option<RunningReceiver>>,
    /// set while a call to `start` is binding sockets
    starting: AtomicBool,
}

/// clears the `starting` flag however `start` returns
struct Starting<'a>(&'a AtomicBool);
impl Drop for Starting<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct RunningReceiver {
    host: IpAddr,
    port: u16,
    udp_port: Option<u16>,
    stop_signal: watch::Sender<bool>,
    accept_loop: JoinHandle<()>,
    udp_loop: Option<JoinHandle<()>>,
    connections: Arc<Mutex<JoinSet<()>>>,
    ctx: Arc<ReceiveContext>,
}

struct ReceiveContext {
    config: ReceiverConfig,
    listener: Arc<dyn MessageListener>,
    task_pool: Arc<RxTaskPool<ReceiveTask>>,
    worker_pool: WorkerPool,
}

impl ReplicationReceiver {
    pub fn new(config: ReceiverConfig) -> ReplicationReceiver {
        ReplicationReceiver {
            config,
            listener: RwLock::new(None),
            running: Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn stats(&self) -> Option<ReceiverStats> {
        self.running.lock().unwrap()
            .as_ref()
            .map(|r| ReceiverStats {
                pool_size: r.ctx.worker_pool.pool_size(),
                active_count: r.ctx.worker_pool.active_count(),
                task_count: r.ctx.worker_pool.task_count(),
                completed_task_count: r.ctx.worker_pool.completed_task_count(),
                outstanding_tasks: r.ctx.task_pool.outstanding(),
            })
    }

    fn read_running<T>(&self, f: impl FnOnce(&RunningReceiver) -> T) -> Option<T> {
        self.running.lock().unwrap()
            .as_ref()
            .map(f)
    }
}

#[async_trait]
impl ChannelReceiver for ReplicationReceiver {
    fn set_message_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.listener.write().unwrap() = Some(listener);
    }

    async fn start(&self) -> Result<(), ChannelError> {
        if self.starting.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(ChannelError::IllegalState("receiver is already starting".to_string()));
        }
        let _starting = Starting(&self.starting);
        if self.is_started() {
            return Err(ChannelError::IllegalState("receiver is already started".to_string()));
        }
        self.config.validate()
            .map_err(|e| ChannelError::Config(e.to_string()))?;
        let listener = self.listener.read().unwrap().clone()
            .ok_or_else(|| ChannelError::IllegalState("no message listener registered with the receiver".to_string()))?;
        let host = self.config.resolve_host()
            .map_err(|e| ChannelError::Config(e.to_string()))?;

        let (tcp_listener, port) = bind_with_retry(host, self.config.port, self.config.auto_bind, |addr| bind_tcp_listener(addr, &self.config))?;
        let port = tcp_listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let udp_socket = match self.config.udp_port {
            None => None,
            Some(udp_port) => {
                let (socket, _) = bind_with_retry_delayed(host, udp_port, self.config.auto_bind, |addr| {
                    bind_udp_socket(addr, self.config.udp_rx_buf_size, self.config.udp_tx_buf_size)
                }).await?;
                Some(socket)
            }
        };
        let udp_port = match &udp_socket {
            None => None,
            Some(s) => Some(s.local_addr().map_err(anyhow::Error::from)?.port()),
        };

        let ctx = Arc::new(ReceiveContext {
            config: self.config.clone(),
            listener,
            task_pool: RxTaskPool::new(self.config.min_tasks, self.config.max_tasks, || ReceiveTask { buf: BytesMut::new() }),
            worker_pool: WorkerPool::new(format!("rx-{}", port), self.config.min_threads, self.config.max_threads, self.config.max_idle_time),
        });

        let (stop_signal, stop_receiver) = watch::channel(false);
        let connections = Arc::new(Mutex::new(JoinSet::new()));

        let accept_loop = tokio::spawn(accept_loop(tcp_listener, ctx.clone(), connections.clone(), stop_receiver.clone()));
        let udp_loop = udp_socket.map(|socket| tokio::spawn(udp_receive_loop(socket, ctx.clone(), stop_receiver)));

        info!("replication receiver listening on {}:{} (UDP: {:?})", host, port, udp_port);
        *self.running.lock().unwrap() = Some(RunningReceiver {
            host,
            port,
            udp_port,
            stop_signal,
            accept_loop,
            udp_loop,
            connections,
            ctx,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), ChannelError> {
        let running = self.running.lock().unwrap().take()
            .ok_or_else(|| ChannelError::IllegalState("receiver is not started".to_string()))?;

        debug!("stopping replication receiver on port {}", running.port);
        let _ = running.stop_signal.send(true);

        running.ctx.task_pool.close();
        running.ctx.worker_pool.shutdown_now();
        running.connections.lock().unwrap().abort_all();

        let accept_abort = running.accept_loop.abort_handle();
        if tokio::time::timeout(self.config.selector_timeout, running.accept_loop).await.is_err() {
            warn!("accept loop did not terminate within {:?}, aborting it", self.config.selector_timeout);
            accept_abort.abort();
        }
        if let Some(udp_loop) = running.udp_loop {
            udp_loop.abort();
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    fn host(&self) -> Option<IpAddr> {
        self.read_running(|r| r.host)
    }

    fn port(&self) -> Option<u16> {
        self.read_running(|r| r.port)
    }

    fn udp_port(&self) -> Option<u16> {
        self.read_running(|r| r.udp_port).flatten()
    }

    fn secure_port(&self) -> Option<u16> {
        self.config.secure_port
    }
}

async fn accept_loop(tcp_listener: TcpListener, ctx: Arc<ReceiveContext>, connections: Arc<Mutex<JoinSet<()>>>, mut stop: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            accepted = tcp_listener.accept() => accepted,
            _ = stop.changed() => {
                debug!("accept loop stopped");
                return;
            }
        };

        match accepted {
            Ok((stream, peer)) => {
                trace!("accepted connection from {}", peer);
                let ctx = ctx.clone();
                let mut connections = connections.lock().unwrap();
                while connections.try_join_next().is_some() {}
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, ctx).await {
                        warn!("connection from {} closed with an error: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                if *stop.borrow() {
                    return;
                }
                error!("error accepting connection: {}", e);
            }
        }
    }
}

#[instrument(name="connection", skip_all, fields(peer = ?peer))]
async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ReceiveContext>) -> anyhow::Result<()> {
    apply_stream_options(&stream, &ctx.config.stream_options())?;

    let (mut read, write) = stream.into_split();
    let write = Arc::new(tokio::sync::Mutex::new(write));
    let mut len_buf = [0u8; Frame::LENGTH_PREFIX_LEN];

    loop {
        match read.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                trace!("connection closed by peer");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let frame_len = u32::from_be_bytes(len_buf) as usize;
        if frame_len > ctx.config.max_frame_size {
            bail!("received a frame of {} bytes, exceeding the maximum of {} - closing the connection", frame_len, ctx.config.max_frame_size);
        }

        let mut task = ctx.task_pool.acquire().await?;
        task.buf.clear();
        task.buf.resize(frame_len, 0);
        tokio::time::timeout(ctx.config.timeout, read.read_exact(&mut task.buf[..])).await
            .map_err(|_| anyhow!("timeout reading a frame of {} bytes", frame_len))??;

        let msg = match Frame::try_deser(&task.buf)? {
            Frame::Data(msg) => msg,
            other => {
                warn!("unexpected {:?} frame on a replication connection - ignoring", other.kind());
                continue;
            }
        };
        trace!(id = ?msg.unique_id, options = ?msg.options, "received message");

        if msg.options.contains(SendOptions::USE_ACK) && !msg.options.contains(SendOptions::SYNCHRONIZED_ACK) {
            send_ack(&write, Frame::Ack(msg.unique_id)).await?;
        }

        let job_ctx = ctx.clone();
        let job_write = write.clone();
        let span = Span::current();
        ctx.worker_pool.execute(async move {
            let sync_ack = msg.options.contains(SendOptions::SYNCHRONIZED_ACK);
            let id = msg.unique_id;

            let processed = deliver(job_ctx.listener.as_ref(), msg).await;
            if sync_ack {
                let ack = if processed { Frame::Ack(id) } else { Frame::FailAck(id) };
                if let Err(e) = send_ack(&job_write, ack).await {
                    debug!("unable to send ack for message {:?}: {}", id, e);
                }
            }
            drop(task);
        }.instrument(span))?;
    }
}

/// Hands a message to the listener, returning `true` if it was accepted and processed
///  successfully
async fn deliver(listener: &dyn MessageListener, msg: ChannelMessage) -> bool {
    if !listener.accept(&msg) {
        trace!(id = ?msg.unique_id, "message was not accepted by the listener");
        return false;
    }

    let id = msg.unique_id;
    match listener.message_received(msg).await {
        Ok(()) => true,
        Err(e) => {
            warn!("error processing message {:?}: {}", id, e);
            false
        }
    }
}

async fn send_ack(write: &tokio::sync::Mutex<OwnedWriteHalf>, ack: Frame) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    ack.ser_length_prefixed(&mut buf);
    let mut write = write.lock().await;
    write.write_all(&buf).await?;
    write.flush().await?;
    Ok(())
}

async fn udp_receive_loop(socket: UdpSocket, ctx: Arc<ReceiveContext>, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = stop.changed() => return,
        };

        let (len, from) = match received {
            Ok(r) => r,
            Err(e) => {
                error!("error receiving UDP datagram: {}", e);
                continue;
            }
        };

        match Frame::try_deser(&buf[..len]) {
            Ok(Frame::Data(msg)) => {
                trace!(id = ?msg.unique_id, "received datagram from {}", from);
                let ctx_for_job = ctx.clone();
                if let Err(e) = ctx.worker_pool.execute(async move {
                    deliver(ctx_for_job.listener.as_ref(), msg).await;
                }) {
                    debug!("unable to process datagram: {}", e);
                }
            }
            Ok(other) => warn!("unexpected {:?} frame in datagram from {} - ignoring", other.kind(), from),
            Err(e) => warn!("invalid datagram from {}: {}", from, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{Buf, Bytes};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use crate::messaging::MockMessageListener;
    use crate::test_util::member::test_member;
    use super::*;

    fn recording_listener(accept: bool, fail: bool) -> (Arc<MockMessageListener>, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (send, receive) = mpsc::unbounded_channel();
        let mut listener = MockMessageListener::new();
        listener.expect_accept().return_const(accept);
        listener.expect_message_received()
            .returning(move |msg| {
                send.send(msg).unwrap();
                if fail { Err(anyhow!("processing failed")) } else { Ok(()) }
            });
        (Arc::new(listener), receive)
    }

    async fn started_receiver(listener: Arc<MockMessageListener>, udp: bool) -> ReplicationReceiver {
        let mut config = ReceiverConfig::localhost(0);
        config.udp_port = udp.then_some(0);
        config.min_threads = 1;
        config.max_threads = 2;
        let receiver = ReplicationReceiver::new(config);
        receiver.set_message_listener(listener);
        receiver.start().await.unwrap();
        receiver
    }

    async fn send_frame(stream: &mut TcpStream, options: SendOptions) -> ChannelMessage {
        let msg = ChannelMessage::new(test_member(1), Bytes::from_static(b"payload"), options);
        let mut buf = BytesMut::new();
        Frame::Data(msg.clone()).ser_length_prefixed(&mut buf);
        stream.write_all(&buf).await.unwrap();
        msg
    }

    async fn read_frame(stream: &mut TcpStream) -> Frame {
        let len = stream.read_u32().await.unwrap() as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        Frame::try_deser(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_ack() {
        let (listener, mut received) = recording_listener(true, false);
        let receiver = started_receiver(listener, false).await;

        let mut stream = TcpStream::connect(("127.0.0.1", receiver.port().unwrap())).await.unwrap();
        let msg = send_frame(&mut stream, SendOptions::USE_ACK).await;

        match read_frame(&mut stream).await {
            Frame::Ack(id) => assert_eq!(id, msg.unique_id),
            other => panic!("unexpected {:?}", other),
        }
        let delivered = received.recv().await.unwrap();
        assert_eq!(delivered.unique_id, msg.unique_id);
        assert_eq!(delivered.payload, msg.payload);

        receiver.stop().await.unwrap();
    }

    #[rstest::rstest]
    #[case::processed(true, false, true)]
    #[case::not_accepted(false, false, false)]
    #[case::failed(true, true, false)]
    #[tokio::test]
    async fn test_sync_ack(#[case] accept: bool, #[case] fail: bool, #[case] expect_ack: bool) {
        let (listener, _received) = recording_listener(accept, fail);
        let receiver = started_receiver(listener, false).await;

        let mut stream = TcpStream::connect(("127.0.0.1", receiver.port().unwrap())).await.unwrap();
        let msg = send_frame(&mut stream, SendOptions::USE_ACK | SendOptions::SYNCHRONIZED_ACK).await;

        match (read_frame(&mut stream).await, expect_ack) {
            (Frame::Ack(id), true) => assert_eq!(id, msg.unique_id),
            (Frame::FailAck(id), false) => assert_eq!(id, msg.unique_id),
            other => panic!("unexpected {:?}", other),
        }
        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_ack_requested() {
        let (listener, mut received) = recording_listener(true, false);
        let receiver = started_receiver(listener, false).await;

        let mut stream = TcpStream::connect(("127.0.0.1", receiver.port().unwrap())).await.unwrap();
        let msg = send_frame(&mut stream, SendOptions::empty()).await;
        assert_eq!(received.recv().await.unwrap().unique_id, msg.unique_id);

        let mut buf = [0u8; 1];
        assert!(tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf)).await.is_err());
        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_frame_closes_connection() {
        let (listener, _received) = recording_listener(true, false);
        let receiver = started_receiver(listener, false).await;

        let mut stream = TcpStream::connect(("127.0.0.1", receiver.port().unwrap())).await.unwrap();
        stream.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();

        let mut buf = BytesMut::new();
        let n = stream.read_buf(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(!buf.has_remaining());

        // the receiver itself keeps running
        let mut stream = TcpStream::connect(("127.0.0.1", receiver.port().unwrap())).await.unwrap();
        let msg = send_frame(&mut stream, SendOptions::USE_ACK).await;
        assert!(matches!(read_frame(&mut stream).await, Frame::Ack(id) if id == msg.unique_id));
        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (listener, _received) = recording_listener(true, false);
        let mut config = ReceiverConfig::localhost(0);
        config.max_frame_size = 100;
        let receiver = ReplicationReceiver::new(config);
        receiver.set_message_listener(listener);
        receiver.start().await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", receiver.port().unwrap())).await.unwrap();
        stream.write_u32(101).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap_or(0), 0);
        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_udp() {
        let (listener, mut received) = recording_listener(true, false);
        let receiver = started_receiver(listener, true).await;
        let udp_port = receiver.udp_port().unwrap();

        let msg = ChannelMessage::new(test_member(1), Bytes::from_static(b"datagram"), SendOptions::UDP | SendOptions::USE_ACK);
        let mut buf = BytesMut::new();
        Frame::Data(msg.clone()).ser(&mut buf);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&buf, ("127.0.0.1", udp_port)).await.unwrap();

        let delivered = received.recv().await.unwrap();
        assert_eq!(delivered.payload.as_ref(), b"datagram");
        receiver.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start() {
        let (listener, _received) = recording_listener(true, false);
        let mut config = ReceiverConfig::localhost(0);
        config.udp_port = Some(0);
        let receiver = Arc::new(ReplicationReceiver::new(config));
        receiver.set_message_listener(listener);

        let starts = (0..4)
            .map(|_| {
                let receiver = receiver.clone();
                tokio::spawn(async move { receiver.start().await })
            })
            .collect::<Vec<_>>();

        let mut started = 0;
        for start in starts {
            match start.await.unwrap() {
                Ok(()) => started += 1,
                Err(e) => assert!(matches!(e, ChannelError::IllegalState(_)), "unexpected error {:?}", e),
            }
        }
        assert_eq!(started, 1);
        assert!(receiver.is_started());

        receiver.stop().await.unwrap();
        assert!(!receiver.is_started());
        receiver.start().await.unwrap();
        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (listener, _received) = recording_listener(true, false);
        let receiver = ReplicationReceiver::new(ReceiverConfig::localhost(0));
        assert!(matches!(receiver.start().await, Err(ChannelError::IllegalState(_))));

        receiver.set_message_listener(listener);
        receiver.start().await.unwrap();
        assert!(receiver.is_started());
        assert!(receiver.port().is_some());
        assert_eq!(receiver.host(), Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)));
        assert!(matches!(receiver.start().await, Err(ChannelError::IllegalState(_))));

        let port = receiver.port().unwrap();
        receiver.stop().await.unwrap();
        assert!(!receiver.is_started());
        assert!(receiver.port().is_none());
        assert!(matches!(receiver.stop().await, Err(ChannelError::IllegalState(_))));

        // the port was released
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
