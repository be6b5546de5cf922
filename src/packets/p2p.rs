use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::packets::{PacketKind, RoutedPacket};

/// Brotli quality 5 is the sweet spot for small chat-sized payloads: measurably smaller
///  than the fast levels without the latency of the high ones.
const COMPRESSION_QUALITY: i32 = 5;

/// An application payload, brotli-compressed on the wire.
///
/// The compression codec is a compatibility-level decision: both ends of a conversation
///  must agree on it, so it is part of the wire format rather than an internal choice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct P2pPacket {
    pub payload: Bytes,
}

impl P2pPacket {
    pub fn new(payload: impl Into<Bytes>) -> P2pPacket {
        P2pPacket { payload: payload.into() }
    }

    /// Convenience for the reliable transport, which carries the same compressed form
    ///  inside datagram payloads.
    pub fn encode(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        P2pPacket::new(Bytes::copy_from_slice(payload)).ser(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut raw: &[u8]) -> anyhow::Result<Bytes> {
        let packet = P2pPacket::try_deser(&mut raw)?;
        if !raw.is_empty() {
            bail!("{} trailing bytes after compressed payload", raw.len());
        }
        Ok(packet.payload)
    }
}

impl RoutedPacket for P2pPacket {
    const KIND: PacketKind = PacketKind::new(b"p2");

    fn ser(&self, buf: &mut BytesMut) {
        let mut compressed = Vec::new();
        let params = brotli::enc::BrotliEncoderParams {
            quality: COMPRESSION_QUALITY,
            ..Default::default()
        };
        let mut reader: &[u8] = &self.payload;
        brotli::BrotliCompress(&mut reader, &mut compressed, &params)
            .expect("compressing into memory cannot fail");

        buf.put_u32(compressed.len() as u32);
        buf.put_slice(&compressed);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<P2pPacket> {
        let compressed_len = buf.try_get_u32()? as usize;
        if buf.remaining() < compressed_len {
            bail!("truncated compressed payload: {} of {} bytes", buf.remaining(), compressed_len);
        }
        let compressed = buf.copy_to_bytes(compressed_len);

        let mut reader: &[u8] = &compressed;
        let mut payload = Vec::new();
        brotli::BrotliDecompress(&mut reader, &mut payload)?;

        Ok(P2pPacket { payload: payload.into() })
    }
}
