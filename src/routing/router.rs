use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::node_id::{NodeId, SessionId};
use crate::packets::{PacketKind, RouteLayerPacket};

/// An established bidirectional byte channel to a neighboring node. The network layer
///  (overlay or relay) owns the actual connectivity; the router only ever enqueues
///  frames on it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NeighborLink: Send + Sync + 'static {
    fn id(&self) -> SessionId;

    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()>;
}

/// Receiver of frames addressed to this node. The packet dispatcher registers itself
///  here; the indirection keeps the router free of any knowledge about packet types.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InboundFrameHandler: Send + Sync + 'static {
    async fn on_packet(&self, packet: RouteLayerPacket, via: SessionId);
}

/// Forwards [RouteLayerPacket]s between node ids across direct or multi-hop paths.
///
/// Routing is best-effort: expired, duplicate and unroutable packets are dropped with a
///  log entry and the sender is never told. There is no retransmission at this layer -
///  loss here is visible to the reliable transport above as missing ACKs.
pub struct Router {
    self_id: NodeId,
    config: Arc<TransportConfig>,
    next_seq: AtomicU32,
    neighbors: RwLock<FxHashMap<SessionId, Arc<dyn NeighborLink>>>,
    routes: RwLock<FxHashMap<NodeId, SessionId>>,
    recent_ids: Mutex<LruCache<(NodeId, u32), ()>>,
    local_handler: RwLock<Option<Arc<dyn InboundFrameHandler>>>,
}

impl Router {
    pub fn new(self_id: NodeId, config: Arc<TransportConfig>) -> Router {
        let recent_ids_capacity = NonZeroUsize::new(config.recent_ids_capacity)
            .unwrap_or(NonZeroUsize::new(4096).expect("literal is non-zero"));

        Router {
            self_id,
            config,
            next_seq: AtomicU32::new(0),
            neighbors: Default::default(),
            routes: Default::default(),
            recent_ids: Mutex::new(LruCache::new(recent_ids_capacity)),
            local_handler: Default::default(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Origin-assigned monotonic counter for locally created frames. Public because
    ///  session implementations that frame their own control packets need it too.
    pub fn allocate_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn set_local_handler(&self, handler: Arc<dyn InboundFrameHandler>) {
        let prev = self.local_handler.write().await.replace(handler);
        if prev.is_some() {
            debug!("replacing the local frame handler of {:?}", self.self_id);
        }
    }

    pub async fn attach_neighbor(&self, link: Arc<dyn NeighborLink>) {
        debug!("attaching neighbor session {:?}", link.id());
        self.neighbors.write().await.insert(link.id(), link);
    }

    /// Removes the neighbor and every routing-table entry pointing at it.
    pub async fn detach_neighbor(&self, session: SessionId) {
        debug!("detaching neighbor session {:?}", session);
        self.neighbors.write().await.remove(&session);
        self.routes.write().await.retain(|_, s| *s != session);
    }

    pub async fn set_route(&self, node: NodeId, session: SessionId) {
        trace!("route {:?} -> {:?}", node, session);
        self.routes.write().await.insert(node, session);
    }

    /// Points the routing-table entries for all announced nodes at the announcing
    ///  session. An empty announcement is a no-op, not a withdrawal.
    pub async fn merge_route_update(&self, via: SessionId, nodes: &[NodeId]) {
        debug!("route update via {:?}: {} nodes", via, nodes.len());
        let mut routes = self.routes.write().await;
        for node in nodes {
            if *node == self.self_id {
                continue;
            }
            routes.insert(*node, via);
        }
    }

    /// Entry point for the network layer: a raw frame arrived on `via`.
    pub async fn handle_frame(&self, via: SessionId, frame: &[u8]) {
        let mut buf = frame;
        let packet = match RouteLayerPacket::try_deser(&mut buf) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("unparseable frame on {:?} - dropping: {}", via, e);
                return;
            }
        };
        self.handle_packet(via, packet).await;
    }

    /// Like [Router::handle_frame], for sessions that already parsed the frame.
    pub async fn handle_packet(&self, via: SessionId, packet: RouteLayerPacket) {
        trace!("received {:?} on {:?}", packet, via);
        self.dispatch(packet, Some(via)).await;
    }

    /// Entry point for the layers above: wraps `body` in a frame with a fresh sequence
    ///  number and the configured initial TTL.
    pub async fn send_packet(&self, to: NodeId, kind: PacketKind, body: Bytes) {
        if to.is_unset() {
            warn!("attempt to send a {:?} packet to the unset node id - dropping", kind);
            return;
        }

        let packet = RouteLayerPacket {
            from: self.self_id,
            to,
            ttl: self.config.default_ttl,
            seq: self.allocate_seq(),
            kind,
            body,
        };
        self.dispatch(packet, None).await;
    }

    /// The forwarding rules: drop on expired TTL, decrement, drop duplicates, then
    ///  either hand up locally or enqueue on the next hop.
    async fn dispatch(&self, mut packet: RouteLayerPacket, via: Option<SessionId>) {
        if packet.ttl == 0 {
            debug!("TTL expired - dropping {:?}", packet);
            return;
        }
        packet.ttl -= 1;

        if !self.record_packet_id(packet.from, packet.seq).await {
            trace!("duplicate - dropping {:?}", packet);
            return;
        }

        if packet.to == self.self_id {
            let handler = self.local_handler.read().await.clone();
            match handler {
                Some(handler) => {
                    handler.on_packet(packet, via.unwrap_or(SessionId::P2P_SENTINEL)).await
                }
                None => warn!("no local handler registered - dropping {:?}", packet),
            }
            return;
        }

        let next_hop = self.routes.read().await.get(&packet.to).copied();
        let Some(session) = next_hop else {
            debug!("no route - dropping {:?}", packet);
            return;
        };

        let link = self.neighbors.read().await.get(&session).cloned();
        let Some(link) = link else {
            debug!("route points at detached session {:?} - dropping {:?}", session, packet);
            return;
        };

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        if let Err(e) = link.send_frame(&buf).await {
            // best-effort at this layer: the reliable transport above notices via ACKs
            debug!("send on {:?} failed: {}", session, e);
        }
    }

    /// Returns false if `(from, seq)` was seen within the recent-ids window.
    async fn record_packet_id(&self, from: NodeId, seq: u32) -> bool {
        self.recent_ids.lock().await.put((from, seq), ()).is_none()
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::always;
    use rstest::rstest;

    use crate::packets::RoutedPacket;
    use crate::packets::TransDatagram;

    use super::*;

    fn test_config() -> Arc<TransportConfig> {
        Arc::new(TransportConfig::new())
    }

    fn frame(from: u128, to: u128, ttl: u8, seq: u32) -> RouteLayerPacket {
        RouteLayerPacket {
            from: NodeId(from),
            to: NodeId(to),
            ttl,
            seq,
            kind: TransDatagram::KIND,
            body: Bytes::from_static(b"body"),
        }
    }

    fn ser(packet: &RouteLayerPacket) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let router = Router::new(NodeId(1), test_config());

        let mut handler = MockInboundFrameHandler::new();
        handler.expect_on_packet()
            .withf(|packet, via| {
                packet.from == NodeId(2) && packet.ttl == 15 && *via == SessionId(9)
            })
            .once()
            .return_const(());
        router.set_local_handler(Arc::new(handler)).await;

        router.handle_frame(SessionId(9), &ser(&frame(2, 1, 16, 0))).await;
    }

    #[rstest]
    #[case::expired(0)]
    fn test_ttl_expired_is_dropped(#[case] ttl: u8) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let router = Router::new(NodeId(1), test_config());

            let mut handler = MockInboundFrameHandler::new();
            handler.expect_on_packet().never();
            router.set_local_handler(Arc::new(handler)).await;

            router.handle_frame(SessionId(9), &ser(&frame(2, 1, ttl, 0))).await;
        });
    }

    #[tokio::test]
    async fn test_duplicate_is_dropped() {
        let router = Router::new(NodeId(1), test_config());

        let mut handler = MockInboundFrameHandler::new();
        handler.expect_on_packet().once().return_const(());
        router.set_local_handler(Arc::new(handler)).await;

        let raw = ser(&frame(2, 1, 16, 42));
        router.handle_frame(SessionId(9), &raw).await;
        router.handle_frame(SessionId(9), &raw).await;

        // same origin, fresh seq: not a duplicate
        let mut handler = MockInboundFrameHandler::new();
        handler.expect_on_packet().once().return_const(());
        router.set_local_handler(Arc::new(handler)).await;
        router.handle_frame(SessionId(9), &ser(&frame(2, 1, 16, 43))).await;
    }

    #[tokio::test]
    async fn test_forwarding_decrements_ttl() {
        let router = Router::new(NodeId(1), test_config());

        let mut link = MockNeighborLink::new();
        link.expect_id().return_const(SessionId(5));
        link.expect_send_frame()
            .withf(|raw| {
                let mut b: &[u8] = raw;
                let packet = RouteLayerPacket::try_deser(&mut b).unwrap();
                packet.ttl == 7 && packet.to == NodeId(3)
            })
            .once()
            .returning(|_| Ok(()));
        router.attach_neighbor(Arc::new(link)).await;
        router.set_route(NodeId(3), SessionId(5)).await;

        router.handle_frame(SessionId(9), &ser(&frame(2, 3, 8, 0))).await;
    }

    #[tokio::test]
    async fn test_unroutable_is_dropped() {
        let router = Router::new(NodeId(1), test_config());

        // no route for node 3, nothing to assert beyond "does not panic"
        router.handle_frame(SessionId(9), &ser(&frame(2, 3, 8, 0))).await;
    }

    #[tokio::test]
    async fn test_send_packet_assigns_fresh_seq() {
        let router = Router::new(NodeId(1), test_config());

        let mut link = MockNeighborLink::new();
        link.expect_id().return_const(SessionId(5));

        let mut seen = Vec::new();
        link.expect_send_frame()
            .times(2)
            .returning_st(move |raw| {
                let mut b: &[u8] = raw;
                let packet = RouteLayerPacket::try_deser(&mut b).unwrap();
                seen.push(packet.seq);
                assert_eq!(seen.len(), seen.iter().collect::<std::collections::BTreeSet<_>>().len());
                Ok(())
            });
        router.attach_neighbor(Arc::new(link)).await;
        router.set_route(NodeId(3), SessionId(5)).await;

        router.send_packet(NodeId(3), TransDatagram::KIND, Bytes::from_static(b"a")).await;
        router.send_packet(NodeId(3), TransDatagram::KIND, Bytes::from_static(b"b")).await;
    }

    #[tokio::test]
    async fn test_route_update_and_detach() {
        let router = Router::new(NodeId(1), test_config());

        let mut link = MockNeighborLink::new();
        link.expect_id().return_const(SessionId(5));
        link.expect_send_frame().once().returning(|_| Ok(()));
        router.attach_neighbor(Arc::new(link)).await;

        // self is never routed through a neighbor
        router.merge_route_update(SessionId(5), &[NodeId(1), NodeId(3)]).await;
        assert_eq!(router.routes.read().await.get(&NodeId(1)), None);
        assert_eq!(router.routes.read().await.get(&NodeId(3)), Some(&SessionId(5)));

        router.send_packet(NodeId(3), TransDatagram::KIND, Bytes::new()).await;

        router.detach_neighbor(SessionId(5)).await;
        assert!(router.routes.read().await.is_empty());

        // after detach the packet is dropped, send_frame is not called again
        router.send_packet(NodeId(3), TransDatagram::KIND, Bytes::new()).await;
    }

    #[tokio::test]
    async fn test_send_to_unset_is_dropped() {
        let router = Router::new(NodeId(1), test_config());
        let mut handler = MockInboundFrameHandler::new();
        handler.expect_on_packet().never();
        router.set_local_handler(Arc::new(handler)).await;

        router.send_packet(NodeId::UNSET, TransDatagram::KIND, Bytes::new()).await;
    }

    #[tokio::test]
    async fn test_unparseable_frame_is_dropped() {
        let router = Router::new(NodeId(1), test_config());
        let mut handler = MockInboundFrameHandler::new();
        handler.expect_on_packet().never();
        router.set_local_handler(Arc::new(handler)).await;

        router.handle_frame(SessionId(9), b"not a frame").await;

        let mut corrupt = ser(&frame(2, 1, 16, 0));
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xff;
        router.handle_frame(SessionId(9), &corrupt).await;
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let router = Router::new(NodeId(1), test_config());

        let mut link = MockNeighborLink::new();
        link.expect_id().return_const(SessionId(5));
        link.expect_send_frame()
            .with(always())
            .once()
            .returning(|_| Err(anyhow::anyhow!("link broke")));
        router.attach_neighbor(Arc::new(link)).await;
        router.set_route(NodeId(3), SessionId(5)).await;

        router.handle_frame(SessionId(9), &ser(&frame(2, 3, 8, 0))).await;
    }
}
