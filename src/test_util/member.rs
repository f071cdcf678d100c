use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bytes::Bytes;

use crate::membership::member::{Member, MemberData, MemberId, UNIQUE_ID_LEN};

/// convenience function for unit test code: create a [Member] based on a number, the same number
///  generating the same member and different numbers different members
pub fn test_member(number: u16) -> Member {
    let mut unique_id = [0u8; UNIQUE_ID_LEN];
    unique_id[..2].copy_from_slice(&number.to_be_bytes());

    Member::new(MemberData {
        unique_id: MemberId(unique_id),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: number,
        udp_port: None,
        secure_port: None,
        name: String::new(),
        domain: Bytes::new(),
        payload: Bytes::new(),
        alive_time: Duration::ZERO,
        local: false,
    })
}
