use anyhow::bail;
use bytes::{Buf, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::node_id::NodeId;
use crate::packets::{PacketKind, RoutedPacket};

/// Liveness probe of the relay protocol: clients send these periodically, the relay
///  echoes them and refreshes the session's watchdog entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeartBeat;

impl RoutedPacket for HeartBeat {
    const KIND: PacketKind = PacketKind::new(b"hb");

    fn ser(&self, _buf: &mut BytesMut) {}

    fn try_deser(_buf: &mut impl Buf) -> anyhow::Result<HeartBeat> {
        Ok(HeartBeat)
    }
}

/// Terminal notice on a relay session. The receiving side is expected to stop using the
///  session; the sending side closes it shortly after.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShutdownMessage;

impl RoutedPacket for ShutdownMessage {
    const KIND: PacketKind = PacketKind::new(b"sd");

    fn ser(&self, _buf: &mut BytesMut) {}

    fn try_deser(_buf: &mut impl Buf) -> anyhow::Result<ShutdownMessage> {
        Ok(ShutdownMessage)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ping;

impl RoutedPacket for Ping {
    const KIND: PacketKind = PacketKind::new(b"pi");

    fn ser(&self, _buf: &mut BytesMut) {}

    fn try_deser(_buf: &mut impl Buf) -> anyhow::Result<Ping> {
        Ok(Ping)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pong;

impl RoutedPacket for Pong {
    const KIND: PacketKind = PacketKind::new(b"po");

    fn ser(&self, _buf: &mut BytesMut) {}

    fn try_deser(_buf: &mut impl Buf) -> anyhow::Result<Pong> {
        Ok(Pong)
    }
}

/// Announcement of the node ids reachable through the sending neighbor. The receiver
///  points its routing-table entries for these nodes at the announcing session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouteUpdate {
    pub nodes: Vec<NodeId>,
}

impl RouteUpdate {
    /// Upper bound on entries per update; a single update must stay well below the frame
    ///  size limit.
    pub const MAX_NODES: usize = 4096;
}

impl RoutedPacket for RouteUpdate {
    const KIND: PacketKind = PacketKind::new(b"rt");

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_varint(self.nodes.len() as u16);
        for node in &self.nodes {
            node.ser(buf);
        }
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<RouteUpdate> {
        let num_nodes = buf.try_get_u16_varint()? as usize;
        if num_nodes > Self::MAX_NODES {
            bail!("route update announces {} nodes, limit is {}", num_nodes, Self::MAX_NODES);
        }

        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            nodes.push(NodeId::try_deser(buf)?);
        }
        Ok(RouteUpdate { nodes })
    }
}
