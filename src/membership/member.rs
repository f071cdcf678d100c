use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes};
use rand::RngCore;

use crate::util::buf::{put_bytes, put_string, try_get_array, try_get_bytes, try_get_string};

pub const UNIQUE_ID_LEN: usize = 16;

/// A member's unique id is random, generated once when a membership service is created. A node
///  that restarts on the same address therefore shows up as a different member.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberId(pub [u8; UNIQUE_ID_LEN]);
impl MemberId {
    pub fn new_random() -> MemberId {
        let mut raw = [0u8; UNIQUE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        MemberId(raw)
    }
}
impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

/// A point-in-time view of a node participating in the group. The membership service owns the
///  authoritative data, and a [Member] is never updated in place: refreshed data results in a
///  new instance.
///
/// Cloning is cheap. Equality (and hashing) is based on unique id and TCP address only, so a
///  stale snapshot is equal to the current data of the same member.
#[derive(Clone)]
pub struct Member(Arc<MemberData>);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemberData {
    pub unique_id: MemberId,
    pub host: IpAddr,
    pub port: u16,
    pub udp_port: Option<u16>,
    pub secure_port: Option<u16>,
    pub name: String,
    /// members only see members with the same domain
    pub domain: Bytes,
    /// opaque application data
    pub payload: Bytes,
    /// how long the member had been alive when this snapshot was taken
    pub alive_time: Duration,
    pub local: bool,
}

impl Member {
    pub fn new(data: MemberData) -> Member {
        Member(Arc::new(data))
    }

    pub fn data(&self) -> &MemberData {
        &self.0
    }

    pub fn unique_id(&self) -> MemberId {
        self.0.unique_id
    }
    pub fn host(&self) -> IpAddr {
        self.0.host
    }
    pub fn port(&self) -> u16 {
        self.0.port
    }
    pub fn udp_port(&self) -> Option<u16> {
        self.0.udp_port
    }
    pub fn secure_port(&self) -> Option<u16> {
        self.0.secure_port
    }
    pub fn name(&self) -> &str {
        &self.0.name
    }
    pub fn domain(&self) -> &Bytes {
        &self.0.domain
    }
    pub fn payload(&self) -> &Bytes {
        &self.0.payload
    }
    pub fn alive_time(&self) -> Duration {
        self.0.alive_time
    }
    pub fn is_local(&self) -> bool {
        self.0.local
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.0.host, self.0.port)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.0.udp_port
            .map(|port| SocketAddr::new(self.0.host, port))
    }

    /// returns a copy with different data, leaving `self` untouched
    pub fn with(&self, f: impl FnOnce(&mut MemberData)) -> Member {
        let mut data = (*self.0).clone();
        f(&mut data);
        Member::new(data)
    }

    /// Serialized form as it is used in membership beacons and as the sender address of messages.
    ///  The `local` flag is not transmitted: a deserialized member is always a remote member.
    pub fn ser(&self, buf: &mut impl BufMut) {
        let data = &self.0;
        buf.put_slice(&data.unique_id.0);
        match data.host {
            IpAddr::V4(ip) => {
                buf.put_u8(4);
                buf.put_u32(ip.to_bits());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(6);
                buf.put_u128(ip.to_bits());
            }
        }
        buf.put_u16(data.port);
        buf.put_u16(data.udp_port.unwrap_or(0));
        buf.put_u16(data.secure_port.unwrap_or(0));
        buf.put_u64(data.alive_time.as_millis() as u64);
        put_string(buf, &data.name);
        put_bytes(buf, &data.domain);
        put_bytes(buf, &data.payload);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Member> {
        let unique_id = MemberId(try_get_array(buf)?);
        let host = match buf.try_get_u8()? {
            4 => IpAddr::V4(Ipv4Addr::from_bits(buf.try_get_u32()?)),
            6 => IpAddr::V6(Ipv6Addr::from_bits(buf.try_get_u128()?)),
            n => return Err(anyhow!("invalid ip address discriminator: {}", n)),
        };
        let port = buf.try_get_u16()?;
        let udp_port = Some(buf.try_get_u16()?).filter(|&p| p != 0);
        let secure_port = Some(buf.try_get_u16()?).filter(|&p| p != 0);
        let alive_time = Duration::from_millis(buf.try_get_u64()?);
        let name = try_get_string(buf)?;
        let domain = try_get_bytes(buf)?;
        let payload = try_get_bytes(buf)?;

        Ok(Member::new(MemberData {
            unique_id,
            host,
            port,
            udp_port,
            secure_port,
            name,
            domain,
            payload,
            alive_time,
            local: false,
        }))
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.0.unique_id == other.0.unique_id
            && self.0.host == other.0.host
            && self.0.port == other.0.port
    }
}
impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.unique_id.hash(state);
        self.0.host.hash(state);
        self.0.port.hash(state);
    }
}

impl Debug for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}@{:?}]", self.socket_addr(), self.0.unique_id)
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.name.is_empty() {
            write!(f, "{}", self.socket_addr())
        }
        else {
            write!(f, "{}({})", self.0.name, self.socket_addr())
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn member(host: &str, udp_port: Option<u16>, name: &str, payload: &'static [u8]) -> Member {
        Member::new(MemberData {
            unique_id: MemberId([7; UNIQUE_ID_LEN]),
            host: host.parse().unwrap(),
            port: 4000,
            udp_port,
            secure_port: None,
            name: name.to_string(),
            domain: Bytes::from_static(b"dom"),
            payload: Bytes::from_static(payload),
            alive_time: Duration::from_millis(1234),
            local: false,
        })
    }

    #[rstest]
    #[case::v4(member("127.0.0.1", None, "", b""))]
    #[case::v4_udp(member("10.1.2.3", Some(4001), "node-a", b"xyz"))]
    #[case::v6(member("2001:db8::1", Some(9), "node-b", b""))]
    fn test_ser_deser(#[case] member: Member) {
        let mut buf = BytesMut::new();
        member.ser(&mut buf);
        let deser = Member::try_deser(&mut buf).unwrap();
        assert_eq!(deser.data(), member.data());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_deser_truncated() {
        let mut buf = BytesMut::new();
        member("127.0.0.1", None, "abc", b"payload").ser(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(Member::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_equality_ignores_data() {
        let a = member("127.0.0.1", None, "a", b"1");
        let b = a.with(|d| {
            d.name = "b".to_string();
            d.payload = Bytes::from_static(b"2");
        });
        assert_eq!(a, b);
        assert_eq!(a.name(), "a");

        let c = a.with(|d| d.port = 4001);
        assert_ne!(a, c);
    }
}
