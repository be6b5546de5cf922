//! Wire-level packet types.
//!
//! Every routed frame is a [RouteLayerPacket]: a fixed header with origin, destination,
//!  TTL and sequence number, a two-byte kind discriminator, and a length-prefixed body.
//!  The body is the serialized form of one typed packet implementing [RoutedPacket];
//!  the kind selects the deserializer on the receiving side.

use std::fmt::{Debug, Formatter};

use bytes::{Buf, BytesMut};

pub mod control;
pub mod datagram;
pub mod frame;
pub mod p2p;

pub use control::{HeartBeat, Ping, Pong, RouteUpdate, ShutdownMessage};
pub use datagram::{DatagramFlags, TransDatagram, BUFFER_LENGTH};
pub use frame::RouteLayerPacket;
pub use p2p::P2pPacket;

/// A [PacketKind] is sent in every routed frame's header to identify the packet type for
///  deserialization and dispatch on the receiving side.
///
/// A kind is technically a u16, but it is intended to be used as two ASCII characters to
///  give it a human-readable name at the wire level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PacketKind(pub u16);

impl PacketKind {
    pub const fn new(value: &[u8; 2]) -> PacketKind {
        Self(u16::from_be_bytes(*value))
    }
}

impl Debug for PacketKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let string_repr = std::str::from_utf8(&bytes).unwrap_or("??");
        write!(f, "0x{:04X}({:?})", self.0, string_repr)
    }
}

/// A typed packet that can travel as the body of a [RouteLayerPacket].
///
/// Each packet type owns its serialization, the dispatcher only ever sees kinds and
///  opaque byte buffers. `Clone` is required because an inbound packet may be handed to
///  both a one-shot listener and the persistent handler for its kind.
pub trait RoutedPacket: Clone + Send + Sync + Sized + 'static {
    const KIND: PacketKind;

    fn ser(&self, buf: &mut BytesMut);

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self>;
}
