use std::fmt::{Debug, Formatter};
use std::ops::BitOr;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::packets::{PacketKind, RoutedPacket};

/// Number of slots in the circular sliding window. Slot indices on the wire are always
///  in `[0, BUFFER_LENGTH)`.
pub const BUFFER_LENGTH: usize = 256;

/// Flag bits of a [TransDatagram]. `SYN` marks a frame that occupies a window slot,
///  `ACK` acknowledges one, `CON` marks connection management frames, `FIN` requests
///  teardown.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct DatagramFlags(pub u8);

impl DatagramFlags {
    pub const SYN: DatagramFlags = DatagramFlags(1);
    pub const ACK: DatagramFlags = DatagramFlags(2);
    pub const CON: DatagramFlags = DatagramFlags(4);
    pub const FIN: DatagramFlags = DatagramFlags(8);

    pub const FIRST_HANDSHAKE: DatagramFlags = DatagramFlags(Self::SYN.0 | Self::CON.0);
    pub const SECOND_HANDSHAKE: DatagramFlags = DatagramFlags(Self::SYN.0 | Self::ACK.0 | Self::CON.0);
    pub const THIRD_HANDSHAKE: DatagramFlags = DatagramFlags(Self::ACK.0 | Self::CON.0);

    pub fn contains(&self, other: DatagramFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DatagramFlags {
    type Output = DatagramFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        DatagramFlags(self.0 | rhs.0)
    }
}

impl Debug for DatagramFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [(Self::SYN, "SYN"), (Self::ACK, "ACK"), (Self::CON, "CON"), (Self::FIN, "FIN")] {
            if self.contains(bit) {
                names.push(name);
            }
        }
        write!(f, "[{}]", names.join("|"))
    }
}

/// The reliable-transport frame exchanged between two peers of a P2P connection.
///
/// `syn_or_ack` indexes the sliding-window buffer: outbound SYNs carry the sender's
///  window slot, ACKs echo the slot being acknowledged. A pure ACK never carries a
///  payload, and neither do handshake frames.
#[derive(Clone, Eq, PartialEq)]
pub struct TransDatagram {
    pub flag: DatagramFlags,
    pub syn_or_ack: u16,
    pub payload: Option<Bytes>,
}

impl Debug for TransDatagram {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.payload {
            Some(payload) => write!(f, "TransDatagram{{{:?} slot:{} payload:{}b}}", self.flag, self.syn_or_ack, payload.len()),
            None => write!(f, "TransDatagram{{{:?} slot:{}}}", self.flag, self.syn_or_ack),
        }
    }
}

impl TransDatagram {
    pub fn first_handshake() -> TransDatagram {
        TransDatagram {
            flag: DatagramFlags::FIRST_HANDSHAKE,
            syn_or_ack: 0,
            payload: None,
        }
    }

    pub fn second_handshake() -> TransDatagram {
        TransDatagram {
            flag: DatagramFlags::SECOND_HANDSHAKE,
            syn_or_ack: 1,
            payload: None,
        }
    }

    pub fn third_handshake() -> TransDatagram {
        TransDatagram {
            flag: DatagramFlags::THIRD_HANDSHAKE,
            syn_or_ack: 2,
            payload: None,
        }
    }

    pub fn data(slot: u16, payload: Bytes) -> TransDatagram {
        debug_assert!((slot as usize) < BUFFER_LENGTH);
        TransDatagram {
            flag: DatagramFlags::SYN,
            syn_or_ack: slot,
            payload: Some(payload),
        }
    }

    pub fn ack(slot: u16) -> TransDatagram {
        debug_assert!((slot as usize) < BUFFER_LENGTH);
        TransDatagram {
            flag: DatagramFlags::ACK,
            syn_or_ack: slot,
            payload: None,
        }
    }

    pub fn fin() -> TransDatagram {
        TransDatagram {
            flag: DatagramFlags::FIN,
            syn_or_ack: 0,
            payload: None,
        }
    }
}

impl RoutedPacket for TransDatagram {
    const KIND: PacketKind = PacketKind::new(b"td");

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.flag.0);
        buf.put_u16(self.syn_or_ack);
        match &self.payload {
            Some(payload) => {
                buf.put_u8(1);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            None => {
                buf.put_u8(0);
            }
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<TransDatagram> {
        let flag = DatagramFlags(buf.try_get_u8()?);
        let syn_or_ack = buf.try_get_u16()?;

        if (syn_or_ack as usize) >= BUFFER_LENGTH {
            bail!("slot {} is outside the window of {} slots", syn_or_ack, BUFFER_LENGTH);
        }

        let payload = match buf.try_get_u8()? {
            0 => None,
            1 => {
                let len = buf.try_get_u32()? as usize;
                if buf.remaining() < len {
                    bail!("truncated datagram payload: {} of {} bytes", buf.remaining(), len);
                }
                Some(buf.copy_to_bytes(len))
            }
            n => bail!("invalid payload presence marker: {}", n),
        };

        Ok(TransDatagram { flag, syn_or_ack, payload })
    }
}
