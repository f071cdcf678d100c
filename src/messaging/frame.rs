use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::channel::send_options::SendOptions;
use crate::membership::member::Member;
use crate::messaging::channel_message::{ChannelMessage, UniqueId};
use crate::util::buf::{put_bytes, try_get_array, try_get_bytes};

const CHECKSUM: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_REDIS);

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Data = 1,
    Ack = 2,
    FailAck = 3,
    Beacon = 4,
    Shutdown = 5,
}

/// Everything that goes over the wire is a [Frame]. On TCP connections, frames are prefixed
///  with their length as a big-endian u32; datagrams contain exactly one frame without prefix.
///
/// ```ascii
/// 0:  magic (u8)
/// 1:  protocol version (u8)
/// 2:  kind (u8)
/// 3:  CRC-64 of the rest of the frame (u64)
/// 11: kind specific content
/// ```
#[derive(Debug, Clone)]
pub enum Frame {
    Data(ChannelMessage),
    Ack(UniqueId),
    FailAck(UniqueId),
    Beacon(Member),
    Shutdown(Member),
}

impl Frame {
    pub const MAGIC: u8 = b'T';
    pub const PROTOCOL_VERSION: u8 = 1;
    pub const HEADER_LEN: usize = 3 + size_of::<u64>();
    pub const LENGTH_PREFIX_LEN: usize = size_of::<u32>();

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data(_) => FrameKind::Data,
            Frame::Ack(_) => FrameKind::Ack,
            Frame::FailAck(_) => FrameKind::FailAck,
            Frame::Beacon(_) => FrameKind::Beacon,
            Frame::Shutdown(_) => FrameKind::Shutdown,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(Self::MAGIC);
        buf.put_u8(Self::PROTOCOL_VERSION);
        buf.put_u8(self.kind().into());
        buf.put_u64(0); // patched below

        let content_start = buf.len();
        match self {
            Frame::Data(msg) => {
                buf.put_u32(msg.options.bits());
                buf.put_slice(&msg.unique_id.0);
                buf.put_u64(msg.timestamp);
                msg.address.ser(buf);
                put_bytes(buf, &msg.payload);
            }
            Frame::Ack(id) | Frame::FailAck(id) => {
                buf.put_slice(&id.0);
            }
            Frame::Beacon(member) | Frame::Shutdown(member) => {
                member.ser(buf);
            }
        }

        let checksum = CHECKSUM.checksum(&buf[content_start..]);
        buf[start + 3..content_start].copy_from_slice(&checksum.to_be_bytes());
    }

    /// serializes the frame with a length prefix for sending it over a stream
    pub fn ser_length_prefixed(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32(0); // patched below
        self.ser(buf);
        let len = (buf.len() - start - Self::LENGTH_PREFIX_LEN) as u32;
        buf[start..start + Self::LENGTH_PREFIX_LEN].copy_from_slice(&len.to_be_bytes());
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<Frame> {
        let magic = buf.try_get_u8()?;
        if magic != Self::MAGIC {
            bail!("invalid magic byte 0x{:02x}", magic);
        }
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }
        let kind = FrameKind::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid frame kind: {}", e))?;
        let checksum = buf.try_get_u64()?;
        if checksum != CHECKSUM.checksum(buf) {
            bail!("checksum error in {:?} frame", kind);
        }

        let result = match kind {
            FrameKind::Data => Frame::Data(Self::try_deser_message(&mut buf)?),
            FrameKind::Ack => Frame::Ack(UniqueId(try_get_array(&mut buf)?)),
            FrameKind::FailAck => Frame::FailAck(UniqueId(try_get_array(&mut buf)?)),
            FrameKind::Beacon => Frame::Beacon(Member::try_deser(&mut buf)?),
            FrameKind::Shutdown => Frame::Shutdown(Member::try_deser(&mut buf)?),
        };

        if buf.has_remaining() {
            bail!("{} unexpected trailing bytes in {:?} frame", buf.remaining(), kind);
        }
        Ok(result)
    }

    fn try_deser_message(buf: &mut impl Buf) -> anyhow::Result<ChannelMessage> {
        let raw_options = buf.try_get_u32()?;
        let options = SendOptions::from_bits(raw_options)
            .ok_or_else(|| anyhow!("invalid send options 0x{:x}", raw_options))?;
        let unique_id = UniqueId(try_get_array(buf)?);
        let timestamp = buf.try_get_u64()?;
        let address = Member::try_deser(buf)?;
        let payload = try_get_bytes(buf)?;

        Ok(ChannelMessage {
            unique_id,
            address,
            timestamp,
            options,
            payload,
        })
    }
}
