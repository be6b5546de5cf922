use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;

use crate::node_id::NodeId;
use crate::packets::PacketKind;

/// CRC-64 over everything after the checksum itself. This is an integrity check against
///  corruption and framing bugs, not an authentication mechanism.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);

impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}

impl Checksum {
    pub fn new(from: NodeId, to: NodeId, ttl: u8, seq: u32, kind: PacketKind, body: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();

        digest.update(&from.0.to_be_bytes());
        digest.update(&to.0.to_be_bytes());
        digest.update(&[ttl]);
        digest.update(&seq.to_be_bytes());
        digest.update(&kind.0.to_be_bytes());
        digest.update(body);

        Checksum(digest.finalize())
    }
}

/// The frame that travels between nodes: addressing, loop protection and a typed,
///  length-prefixed body.
///
/// `seq` is assigned by the origin and is monotonic per origin; forwarders use
///  `(from, seq)` for duplicate suppression. `ttl` decreases strictly along any
///  forwarded path.
#[derive(Clone, Eq, PartialEq)]
pub struct RouteLayerPacket {
    pub from: NodeId,
    pub to: NodeId,
    pub ttl: u8,
    pub seq: u32,
    pub kind: PacketKind,
    pub body: Bytes,
}

impl Debug for RouteLayerPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RouteLayerPacket{{{:?}->{:?} ttl:{} seq:{} kind:{:?} body:{}b}}",
            self.from,
            self.to,
            self.ttl,
            self.seq,
            self.kind,
            self.body.len(),
        )
    }
}

impl RouteLayerPacket {
    pub fn ser(&self, buf: &mut BytesMut) {
        let checksum = Checksum::new(self.from, self.to, self.ttl, self.seq, self.kind, &self.body);

        buf.put_u64(checksum.0);
        self.from.ser(buf);
        self.to.ser(buf);
        buf.put_u8(self.ttl);
        buf.put_u32(self.seq);
        buf.put_u16(self.kind.0);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RouteLayerPacket> {
        let checksum = Checksum(buf.try_get_u64()?);
        let from = NodeId::try_deser(buf)?;
        let to = NodeId::try_deser(buf)?;
        let ttl = buf.try_get_u8()?;
        let seq = buf.try_get_u32()?;
        let kind = PacketKind(buf.try_get_u16()?);

        let body_len = buf.try_get_u32()? as usize;
        if buf.remaining() < body_len {
            bail!("truncated frame: body length {} exceeds remaining {} bytes", body_len, buf.remaining());
        }
        let body = buf.copy_to_bytes(body_len);

        let actual = Checksum::new(from, to, ttl, seq, kind, &body);
        if checksum != actual {
            bail!("checksum mismatch: header says {:?}, frame hashes to {:?}", checksum, actual);
        }

        Ok(RouteLayerPacket { from, to, ttl, seq, kind, body })
    }
}
