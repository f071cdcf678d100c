use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::error::ChannelError;
use crate::channel::listener::MembershipListener;
use crate::channel::services::ServiceSet;
use crate::membership::member::{Member, MemberData, MemberId};
use crate::membership::member_table::{MemberTable, MemberUpdate};
use crate::membership::membership_config::MembershipConfig;
use crate::messaging::channel_message::ChannelMessage;
use crate::messaging::frame::Frame;
use crate::messaging::MessageListener;

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Maintains the set of live members of the group, and announces the local member to the others.
///
/// The service consists of two independently startable parts: the membership listener
///  ([ServiceSet::MBR_RX_SEQ]) and the membership broadcaster ([ServiceSet::MBR_TX_SEQ]).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipService: Send + Sync + 'static {
    async fn start(&self, level: ServiceSet) -> Result<(), ChannelError>;
    async fn stop(&self, level: ServiceSet) -> Result<(), ChannelError>;

    /// starts both listening and broadcasting
    async fn join(&self) -> Result<(), ChannelError> {
        self.start(ServiceSet::MBR_RX_SEQ | ServiceSet::MBR_TX_SEQ).await
    }

    async fn leave(&self) -> Result<(), ChannelError> {
        self.stop(ServiceSet::MBR_RX_SEQ | ServiceSet::MBR_TX_SEQ).await
    }

    /// snapshot of all currently known remote members
    fn members(&self) -> Vec<Member>;
    fn has_members(&self) -> bool;

    /// the current data of a member, `None` if it is not (or no longer) a member
    fn get_member(&self, member: &Member) -> Option<Member>;

    fn local_member(&self, include_alive_time: bool) -> Member;

    /// Sets the addresses that are advertised for the local member. This must be called before
    ///  broadcasting starts.
    fn set_local_member_properties(&self, host: IpAddr, port: u16, udp_port: Option<u16>, secure_port: Option<u16>);
    fn set_payload(&self, payload: Bytes);
    fn set_domain(&self, domain: Bytes);

    /// sends a message to everybody listening on the membership address(es)
    async fn broadcast(&self, msg: ChannelMessage) -> Result<(), ChannelError>;

    /// evicts members that were not heard from for longer than the drop time
    async fn heartbeat(&self);

    fn set_membership_listener(&self, listener: Arc<dyn MembershipListener>);

    /// the listener for messages that were sent through the membership broadcast
    fn set_message_listener(&self, listener: Arc<dyn MessageListener>);
}

/// A [MembershipService] based on periodic UDP beacons sent to a list of addresses, typically
///  a multicast group.
///
/// Listeners are called from a separate task, in the order in which the events occurred, so a
///  slow listener does not delay the processing of beacons.
pub struct BroadcastMembershipService {
    inner: Arc<MembershipInner>,
    rx_task: Mutex<Option<JoinHandle<()>>>,
    tx_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
enum Notification {
    Added(Member),
    Disappeared(Member),
    Message(ChannelMessage),
}

struct MembershipInner {
    config: MembershipConfig,
    table: MemberTable,
    local: RwLock<MemberData>,
    created: Instant,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    membership_listener: RwLock<Option<Arc<dyn MembershipListener>>>,
    message_listener: RwLock<Option<Arc<dyn MessageListener>>>,
    /// present while the membership listener is running
    notifications: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
}

impl BroadcastMembershipService {
    pub fn new(config: MembershipConfig) -> BroadcastMembershipService {
        let local = MemberData {
            unique_id: MemberId::new_random(),
            host: config.bind_addr.ip(),
            port: 0,
            udp_port: None,
            secure_port: None,
            name: config.local_name.clone(),
            domain: config.domain.clone(),
            payload: config.payload.clone(),
            alive_time: Default::default(),
            local: true,
        };

        BroadcastMembershipService {
            inner: Arc::new(MembershipInner {
                config,
                table: MemberTable::new(),
                local: RwLock::new(local),
                created: Instant::now(),
                socket: Mutex::new(None),
                membership_listener: RwLock::new(None),
                message_listener: RwLock::new(None),
                notifications: Mutex::new(None),
            }),
            rx_task: Mutex::new(None),
            tx_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.inner.config
    }

    /// the address the membership socket is bound to, `None` if neither part is started
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.socket.lock().unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    fn is_running(task: &Mutex<Option<JoinHandle<()>>>) -> bool {
        task.lock().unwrap().is_some()
    }

    /// The socket is shared by listener and broadcaster: it is opened when the first of them
    ///  starts and closed when the last of them stops.
    fn open_socket(&self) -> Result<Arc<UdpSocket>, ChannelError> {
        let mut socket = self.inner.socket.lock().unwrap();
        if let Some(s) = socket.as_ref() {
            return Ok(s.clone());
        }
        let s = Arc::new(bind_membership_socket(&self.inner.config)
            .map_err(|source| ChannelError::Bind { addr: self.inner.config.bind_addr, attempts: 1, source })?);
        debug!("membership socket bound to {:?}", s.local_addr());
        *socket = Some(s.clone());
        Ok(s)
    }

    fn close_socket_if_unused(&self) {
        if !Self::is_running(&self.rx_task) && !Self::is_running(&self.tx_task) {
            self.inner.socket.lock().unwrap().take();
        }
    }

    async fn start_rx(&self) -> Result<(), ChannelError> {
        if Self::is_running(&self.rx_task) {
            return Err(ChannelError::IllegalState("membership listener is already started".to_string()));
        }
        let socket = self.open_socket()?;

        let (send, receive) = mpsc::unbounded_channel();
        *self.inner.notifications.lock().unwrap() = Some(send);
        *self.dispatch_task.lock().unwrap() = Some(tokio::spawn(dispatch_loop(self.inner.clone(), receive)));

        let handle = tokio::spawn(receive_loop(self.inner.clone(), socket));
        *self.rx_task.lock().unwrap() = Some(handle);
        info!("membership listener started on {:?}", self.inner.config.bind_addr);
        Ok(())
    }

    async fn start_tx(&self) -> Result<(), ChannelError> {
        if Self::is_running(&self.tx_task) {
            return Err(ChannelError::IllegalState("membership broadcaster is already started".to_string()));
        }
        if self.inner.local.read().unwrap().port == 0 {
            return Err(ChannelError::IllegalState("local member properties must be set before broadcasting".to_string()));
        }
        let socket = self.open_socket()?;
        let handle = tokio::spawn(broadcast_loop(self.inner.clone(), socket));
        *self.tx_task.lock().unwrap() = Some(handle);
        info!("membership broadcaster started, sending to {:?}", self.inner.config.broadcast_addrs);
        Ok(())
    }

    async fn stop_rx(&self) -> Result<(), ChannelError> {
        let handle = self.rx_task.lock().unwrap().take()
            .ok_or_else(|| ChannelError::IllegalState("membership listener is not started".to_string()))?;
        handle.abort();

        for member in self.inner.table.clear() {
            self.inner.notify(Notification::Disappeared(member));
        }
        // pending notifications are delivered before stopping returns
        self.inner.notifications.lock().unwrap().take();
        let dispatch = self.dispatch_task.lock().unwrap().take();
        if let Some(dispatch) = dispatch {
            if let Err(e) = dispatch.await {
                warn!("membership listener task failed: {}", e);
            }
        }
        debug!("membership listener stopped");
        Ok(())
    }

    async fn stop_tx(&self) -> Result<(), ChannelError> {
        let handle = self.tx_task.lock().unwrap().take()
            .ok_or_else(|| ChannelError::IllegalState("membership broadcaster is not started".to_string()))?;
        handle.abort();

        // explicit leave notification, so other members need not wait for the drop time
        let socket = self.inner.socket.lock().unwrap().clone();
        if let Some(socket) = socket {
            let frame = Frame::Shutdown(self.local_member(true));
            self.inner.send_to_all(&socket, &frame).await;
        }
        debug!("membership broadcaster stopped");
        Ok(())
    }
}

#[async_trait]
impl MembershipService for BroadcastMembershipService {
    async fn start(&self, level: ServiceSet) -> Result<(), ChannelError> {
        check_level(level)?;
        self.inner.config.validate()
            .map_err(|e| ChannelError::Config(e.to_string()))?;

        if level.contains(ServiceSet::MBR_RX_SEQ) {
            self.start_rx().await?;
        }
        if level.contains(ServiceSet::MBR_TX_SEQ) {
            self.start_tx().await?;
        }
        Ok(())
    }

    async fn stop(&self, level: ServiceSet) -> Result<(), ChannelError> {
        check_level(level)?;

        let mut result = Ok(());
        if level.contains(ServiceSet::MBR_TX_SEQ) {
            result = self.stop_tx().await;
        }
        if level.contains(ServiceSet::MBR_RX_SEQ) {
            result = result.and(self.stop_rx().await);
        }
        self.close_socket_if_unused();
        result
    }

    fn members(&self) -> Vec<Member> {
        self.inner.table.members()
    }

    fn has_members(&self) -> bool {
        self.inner.table.has_members()
    }

    fn get_member(&self, member: &Member) -> Option<Member> {
        self.inner.table.get(member)
    }

    fn local_member(&self, include_alive_time: bool) -> Member {
        self.inner.local_member(include_alive_time)
    }

    fn set_local_member_properties(&self, host: IpAddr, port: u16, udp_port: Option<u16>, secure_port: Option<u16>) {
        let mut local = self.inner.local.write().unwrap();
        local.host = host;
        local.port = port;
        local.udp_port = udp_port;
        local.secure_port = secure_port;
    }

    fn set_payload(&self, payload: Bytes) {
        self.inner.local.write().unwrap().payload = payload;
    }

    fn set_domain(&self, domain: Bytes) {
        self.inner.local.write().unwrap().domain = domain;
    }

    async fn broadcast(&self, msg: ChannelMessage) -> Result<(), ChannelError> {
        let socket = self.inner.socket.lock().unwrap().clone()
            .ok_or_else(|| ChannelError::IllegalState("membership service is not started".to_string()))?;
        let frame = Frame::Data(msg);
        if self.inner.send_to_all(&socket, &frame).await {
            Ok(())
        }
        else {
            Err(anyhow::anyhow!("broadcast failed for all addresses").into())
        }
    }

    async fn heartbeat(&self) {
        let expired = self.inner.table.expire(tokio::time::Instant::now(), self.inner.config.drop_time);
        for member in expired {
            info!("member {} expired", member);
            self.inner.notify(Notification::Disappeared(member));
        }
    }

    fn set_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        *self.inner.membership_listener.write().unwrap() = Some(listener);
    }

    fn set_message_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.inner.message_listener.write().unwrap() = Some(listener);
    }
}

impl Drop for BroadcastMembershipService {
    fn drop(&mut self) {
        self.inner.notifications.lock().unwrap().take();
        for task in [&self.rx_task, &self.tx_task, &self.dispatch_task] {
            if let Some(handle) = task.lock().unwrap().take() {
                handle.abort();
            }
        }
    }
}

fn check_level(level: ServiceSet) -> Result<(), ChannelError> {
    let membership_levels = ServiceSet::MBR_RX_SEQ | ServiceSet::MBR_TX_SEQ;
    if level.is_empty() || !membership_levels.contains(level) {
        return Err(ChannelError::Config(format!("{} is not a valid membership service level", level)));
    }
    Ok(())
}

fn bind_membership_socket(config: &MembershipConfig) -> std::io::Result<UdpSocket> {
    let domain = if config.bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(config.rx_buf_size)?;
    socket.set_send_buffer_size(config.tx_buf_size)?;
    socket.bind(&config.bind_addr.into())?;

    let interface = match config.bind_addr.ip() {
        IpAddr::V4(ip) if !ip.is_multicast() => ip,
        _ => Ipv4Addr::UNSPECIFIED,
    };
    for group in config.multicast_groups() {
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_multicast_loop_v4(config.multicast_loop)?;
        if let Some(ttl) = config.multicast_ttl {
            socket.set_multicast_ttl_v4(ttl)?;
        }
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

impl MembershipInner {
    fn local_member(&self, include_alive_time: bool) -> Member {
        let mut data = self.local.read().unwrap().clone();
        if include_alive_time {
            data.alive_time = self.created.elapsed();
        }
        Member::new(data)
    }

    fn is_foreign(&self, member: &Member) -> bool {
        let local = self.local.read().unwrap();
        if member.unique_id() == local.unique_id {
            return true;
        }
        if member.domain() != &local.domain {
            trace!("ignoring {:?} from domain {:?}", member, member.domain());
            return true;
        }
        false
    }

    /// returns `true` if the frame was sent to at least one address
    async fn send_to_all(&self, socket: &UdpSocket, frame: &Frame) -> bool {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);

        let mut any_success = false;
        for addr in &self.config.broadcast_addrs {
            match socket.send_to(&buf, addr).await {
                Ok(_) => any_success = true,
                Err(e) => warn!("error sending {:?} frame to {}: {}", frame.kind(), addr, e),
            }
        }
        any_success
    }

    fn notify(&self, notification: Notification) {
        match self.notifications.lock().unwrap().as_ref() {
            Some(send) => {
                let _ = send.send(notification);
            }
            None => debug!("membership listener is stopped, dropping {:?}", notification),
        }
    }

    async fn dispatch(&self, notification: Notification) {
        match notification {
            Notification::Added(member) => {
                let listener = self.membership_listener.read().unwrap().clone();
                if let Some(listener) = listener {
                    listener.member_added(&member).await;
                }
            }
            Notification::Disappeared(member) => {
                let listener = self.membership_listener.read().unwrap().clone();
                if let Some(listener) = listener {
                    listener.member_disappeared(&member).await;
                }
            }
            Notification::Message(msg) => {
                let listener = self.message_listener.read().unwrap().clone();
                match listener {
                    Some(listener) if listener.accept(&msg) => {
                        let id = msg.unique_id;
                        if let Err(e) = listener.message_received(msg).await {
                            warn!("error processing broadcast message {:?}: {}", id, e);
                        }
                    }
                    Some(_) => trace!("broadcast message {:?} was not accepted", msg.unique_id),
                    None => debug!("no listener for broadcast message {:?}", msg.unique_id),
                }
            }
        }
    }

    fn on_datagram(&self, buf: &[u8], from: SocketAddr) {
        let frame = match Frame::try_deser(buf) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("invalid membership datagram from {}: {}", from, e);
                return;
            }
        };

        match frame {
            Frame::Beacon(member) => {
                if self.is_foreign(&member) {
                    return;
                }
                match self.table.member_alive(member, tokio::time::Instant::now()) {
                    MemberUpdate::Added(member) => {
                        info!("member {} joined", member);
                        self.notify(Notification::Added(member));
                    }
                    MemberUpdate::Refreshed(member) => trace!("beacon from {:?}", member),
                }
            }
            Frame::Shutdown(member) => {
                if self.is_foreign(&member) {
                    return;
                }
                if let Some(member) = self.table.remove(&member.unique_id()) {
                    info!("member {} left", member);
                    self.notify(Notification::Disappeared(member));
                }
            }
            Frame::Data(msg) => {
                if self.is_foreign(&msg.address) {
                    return;
                }
                self.notify(Notification::Message(msg));
            }
            other => warn!("unexpected {:?} frame on the membership socket from {}", other.kind(), from),
        }
    }
}

async fn receive_loop(inner: Arc<MembershipInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut expiry = tokio::time::interval(inner.config.frequency);
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => inner.on_datagram(&buf[..len], from),
                Err(e) => error!("error receiving on the membership socket: {}", e),
            },
            _ = expiry.tick() => {
                for member in inner.table.expire(tokio::time::Instant::now(), inner.config.drop_time) {
                    info!("member {} expired", member);
                    inner.notify(Notification::Disappeared(member));
                }
            }
        }
    }
}

async fn dispatch_loop(inner: Arc<MembershipInner>, mut notifications: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        inner.dispatch(notification).await;
    }
    trace!("membership notifications closed");
}

async fn broadcast_loop(inner: Arc<MembershipInner>, socket: Arc<UdpSocket>) {
    let mut ticks = tokio::time::interval(inner.config.frequency);
    loop {
        ticks.tick().await;
        let beacon = Frame::Beacon(inner.local_member(true));
        inner.send_to_all(&socket, &beacon).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use crate::channel::send_options::SendOptions;
    use crate::messaging::MockMessageListener;
    use crate::test_util::listener::{MembershipEvent, RecordingMembershipListener};
    use crate::test_util::net::free_udp_ports;
    use super::*;

    fn fast_config(port: u16, all_ports: &[u16]) -> MembershipConfig {
        MembershipConfig {
            frequency: Duration::from_millis(50),
            drop_time: Duration::from_millis(400),
            ..MembershipConfig::localhost(port, all_ports)
        }
    }

    async fn started_service(port: u16, all_ports: &[u16], tcp_port: u16) -> (BroadcastMembershipService, Arc<RecordingMembershipListener>) {
        let service = BroadcastMembershipService::new(fast_config(port, all_ports));
        let listener = Arc::new(RecordingMembershipListener::default());
        service.set_membership_listener(listener.clone());
        service.set_local_member_properties(IpAddr::V4(Ipv4Addr::LOCALHOST), tcp_port, None, None);
        service.join().await.unwrap();
        (service, listener)
    }

    #[tokio::test]
    async fn test_discovery_and_leave() {
        let ports = free_udp_ports(2);
        let (a, a_events) = started_service(ports[0], &ports, 7001).await;
        let (b, b_events) = started_service(ports[1], &ports, 7002).await;

        let b_seen_by_a = a_events.next_event().await;
        assert_eq!(b_seen_by_a, MembershipEvent::Added(b.local_member(false)));
        assert_eq!(b_events.next_event().await, MembershipEvent::Added(a.local_member(false)));

        assert_eq!(a.members(), vec![b.local_member(false)]);
        assert!(a.has_members());
        assert_eq!(a.get_member(&b.local_member(false)).unwrap().port(), 7002);

        // further beacons only refresh
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a_events.try_next_event().is_none());

        b.leave().await.unwrap();
        assert_eq!(a_events.next_event().await, MembershipEvent::Disappeared(b.local_member(false)));
        assert!(!a.has_members());

        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_expiry() {
        let ports = free_udp_ports(2);
        let (a, a_events) = started_service(ports[0], &ports, 7001).await;

        // a member that sends a single beacon and is never heard from again
        let ghost = BroadcastMembershipService::new(fast_config(ports[1], &ports));
        ghost.set_local_member_properties(IpAddr::V4(Ipv4Addr::LOCALHOST), 7002, None, None);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = BytesMut::new();
        Frame::Beacon(ghost.local_member(true)).ser(&mut buf);
        socket.send_to(&buf, ("127.0.0.1", ports[0])).await.unwrap();

        assert_eq!(a_events.next_event().await, MembershipEvent::Added(ghost.local_member(false)));
        assert_eq!(a_events.next_event().await, MembershipEvent::Disappeared(ghost.local_member(false)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        a.heartbeat().await;
        assert!(a_events.try_next_event().is_none());
        a.leave().await.unwrap();
    }

    /// holds back `member_added` calls until a permit is available
    struct GatedListener {
        gate: Semaphore,
        events: RecordingMembershipListener,
    }

    #[async_trait]
    impl MembershipListener for GatedListener {
        async fn member_added(&self, member: &Member) {
            self.gate.acquire().await.unwrap().forget();
            self.events.member_added(member).await;
        }

        async fn member_disappeared(&self, member: &Member) {
            self.events.member_disappeared(member).await;
        }
    }

    #[tokio::test]
    async fn test_slow_listener_does_not_block_beacons() {
        let ports = free_udp_ports(2);
        let a = BroadcastMembershipService::new(fast_config(ports[0], &ports));
        let listener = Arc::new(GatedListener { gate: Semaphore::new(0), events: Default::default() });
        a.set_membership_listener(listener.clone());
        a.start(ServiceSet::MBR_RX_SEQ).await.unwrap();

        let ghosts = [7002, 7003].map(|tcp_port| {
            let ghost = BroadcastMembershipService::new(fast_config(ports[1], &ports));
            ghost.set_local_member_properties(IpAddr::V4(Ipv4Addr::LOCALHOST), tcp_port, None, None);
            ghost.local_member(false)
        });
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for ghost in &ghosts {
            let mut buf = BytesMut::new();
            Frame::Beacon(ghost.clone()).ser(&mut buf);
            socket.send_to(&buf, ("127.0.0.1", ports[0])).await.unwrap();
        }

        // both beacons are processed while the listener is still busy with the first one
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.members().len(), 2);
        assert!(listener.events.try_next_event().is_none());

        listener.gate.add_permits(2);
        assert_eq!(listener.events.next_event().await, MembershipEvent::Added(ghosts[0].clone()));
        assert_eq!(listener.events.next_event().await, MembershipEvent::Added(ghosts[1].clone()));

        a.stop(ServiceSet::MBR_RX_SEQ).await.unwrap();
    }

    #[tokio::test]
    async fn test_other_domain_is_ignored() {
        let ports = free_udp_ports(2);
        let (a, a_events) = started_service(ports[0], &ports, 7001).await;

        let other = BroadcastMembershipService::new(MembershipConfig {
            domain: Bytes::from_static(b"other"),
            ..fast_config(ports[1], &ports)
        });
        other.set_local_member_properties(IpAddr::V4(Ipv4Addr::LOCALHOST), 7002, None, None);
        other.join().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(a_events.try_next_event().is_none());
        assert!(!a.has_members());

        other.leave().await.unwrap();
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_message() {
        let ports = free_udp_ports(2);
        let (a, _) = started_service(ports[0], &ports, 7001).await;
        let (b, _) = started_service(ports[1], &ports, 7002).await;

        let (send, mut receive) = tokio::sync::mpsc::unbounded_channel();
        let mut listener = MockMessageListener::new();
        listener.expect_accept().return_const(true);
        listener.expect_message_received()
            .returning(move |msg| {
                send.send(msg).unwrap();
                Ok(())
            });
        b.set_message_listener(Arc::new(listener));

        let msg = ChannelMessage::new(a.local_member(false), Bytes::from_static(b"to all"), SendOptions::MULTICAST);
        a.broadcast(msg.clone()).await.unwrap();

        let received = receive.recv().await.unwrap();
        assert_eq!(received.unique_id, msg.unique_id);
        assert_eq!(received.payload.as_ref(), b"to all");

        a.leave().await.unwrap();
        b.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let ports = free_udp_ports(1);
        let service = BroadcastMembershipService::new(fast_config(ports[0], &ports));

        // the broadcaster needs the local member's addresses
        assert!(matches!(service.start(ServiceSet::MBR_TX_SEQ).await, Err(ChannelError::IllegalState(_))));
        assert!(matches!(service.start(ServiceSet::SND_RX_SEQ).await, Err(ChannelError::Config(_))));

        service.start(ServiceSet::MBR_RX_SEQ).await.unwrap();
        assert!(service.bound_addr().is_some());
        assert!(matches!(service.start(ServiceSet::MBR_RX_SEQ).await, Err(ChannelError::IllegalState(_))));
        assert!(matches!(service.stop(ServiceSet::MBR_TX_SEQ).await, Err(ChannelError::IllegalState(_))));

        service.stop(ServiceSet::MBR_RX_SEQ).await.unwrap();
        assert!(service.bound_addr().is_none());
    }

    #[test]
    fn test_local_member() {
        let service = BroadcastMembershipService::new(MembershipConfig {
            local_name: "node-a".to_string(),
            ..Default::default()
        });
        service.set_local_member_properties(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000, Some(4001), None);
        service.set_payload(Bytes::from_static(b"p"));

        let local = service.local_member(false);
        assert!(local.is_local());
        assert_eq!(local.name(), "node-a");
        assert_eq!(local.port(), 4000);
        assert_eq!(local.udp_port(), Some(4001));
        assert_eq!(local.payload().as_ref(), b"p");
        assert_eq!(local.alive_time(), Duration::ZERO);
        assert_eq!(local, service.local_member(true));
    }
}
