use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Opaque 128-bit identifier of a node, stable for the lifetime of a signin.
///
/// The zero value is reserved: it means "unset", and the router treats packets addressed
///  to it as undeliverable rather than as a broadcast.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u128);

impl NodeId {
    pub const UNSET: NodeId = NodeId(0);

    /// Draws a fresh random id. Uniqueness is statistical (UUID v4), which is the same
    ///  guarantee the signin tokens this id stands in for provide.
    pub fn generate() -> NodeId {
        NodeId(Uuid::new_v4().as_u128())
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u128(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeId> {
        Ok(NodeId(buf.try_get_u128()?))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // the full 32 hex digits drown out log lines - the trailing digits are where
        //  test ids and sequentially assigned ids differ
        write!(f, "N#{:x}", self.0 & 0xffff_ffff)
    }
}

/// Handle for an established bidirectional byte channel with a neighbor, assigned by the
///  network layer. Distinct from [NodeId]: a session identifies a link, not an identity.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Sentinel handle under which messages arriving over a reliable P2P connection are
    ///  handed to the application dispatcher - there is no real session behind them.
    pub const P2P_SENTINEL: SessionId = SessionId(u64::MAX);
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == Self::P2P_SENTINEL {
            write!(f, "S#p2p")
        }
        else {
            write!(f, "S#{}", self.0)
        }
    }
}
