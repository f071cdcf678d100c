use std::net::{Ipv4Addr, TcpListener, UdpSocket};

/// Returns UDP ports on the loopback interface that were free a moment ago. The sockets are
///  closed again, so there is a (small) chance that somebody else grabs a port in between.
pub fn free_udp_ports(n: usize) -> Vec<u16> {
    let sockets = (0..n)
        .map(|_| UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("no free UDP port"))
        .collect::<Vec<_>>();
    sockets.iter()
        .map(|s| s.local_addr().expect("bound socket has an address").port())
        .collect()
}

pub fn free_tcp_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|l| l.local_addr())
        .expect("no free TCP port")
        .port()
}
