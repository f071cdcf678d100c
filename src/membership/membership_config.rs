use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;

pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(228, 0, 0, 4);
pub const DEFAULT_MEMBERSHIP_PORT: u16 = 45564;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// The address the membership socket is bound to. If it is shared with other processes on
    ///  the same host (as it is for multicast), the socket is bound with address reuse.
    pub bind_addr: SocketAddr,

    /// Every beacon is sent to all of these addresses. They can be multicast groups (which are
    ///  joined when the membership listener starts), broadcast addresses, or a static list of
    ///  the other members' membership addresses.
    pub broadcast_addrs: Vec<SocketAddr>,

    /// the interval in which the local member's beacon is sent
    pub frequency: Duration,

    /// A member is considered gone if no beacon was received from it for this long. This should
    ///  be several times `frequency` to tolerate lost datagrams.
    pub drop_time: Duration,

    pub multicast_ttl: Option<u32>,
    pub multicast_loop: bool,

    /// the local member's name, for diagnostic purposes
    pub local_name: String,

    /// Members only see other members with the same domain. This allows separate groups to share
    ///  a multicast address.
    pub domain: Bytes,

    /// application data sent with every beacon
    pub payload: Bytes,

    pub rx_buf_size: usize,
    pub tx_buf_size: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_MEMBERSHIP_PORT),
            broadcast_addrs: vec![SocketAddr::new(IpAddr::V4(DEFAULT_MULTICAST_GROUP), DEFAULT_MEMBERSHIP_PORT)],
            frequency: Duration::from_millis(500),
            drop_time: Duration::from_secs(3),
            multicast_ttl: None,
            multicast_loop: true,
            local_name: String::new(),
            domain: Bytes::new(),
            payload: Bytes::new(),
            rx_buf_size: 25188,
            tx_buf_size: 25188,
        }
    }
}

impl MembershipConfig {
    /// A config for a static group of members on the loopback interface, each of them listening
    ///  on one of the given ports. This is useful for testing, and for environments without
    ///  multicast.
    pub fn localhost(port: u16, all_ports: &[u16]) -> MembershipConfig {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        MembershipConfig {
            bind_addr: SocketAddr::new(localhost, port),
            broadcast_addrs: all_ports.iter()
                .filter(|&&p| p != port)
                .map(|&p| SocketAddr::new(localhost, p))
                .collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.frequency.is_zero() {
            bail!("membership frequency must be positive");
        }
        if self.drop_time <= self.frequency {
            bail!("drop time ({:?}) must be greater than the beacon frequency ({:?})", self.drop_time, self.frequency);
        }
        Ok(())
    }

    pub fn multicast_groups(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.broadcast_addrs.iter()
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) if ip.is_multicast() => Some(ip),
                _ => None,
            })
    }
}
