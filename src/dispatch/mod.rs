//! Typed packet multiplexing on top of the router.
//!
//! The dispatcher owns one slot per [PacketKind]. A slot has at most one persistent
//!  handler plus any number of one-shot listeners waiting for a response that matches
//!  their predicate. Frames from a single session are handed up by the router one at a
//!  time, so handlers for one kind run serialized per sender; handlers for distinct
//!  kinds may interleave freely.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::RequestError;
use crate::node_id::{NodeId, SessionId};
use crate::packets::{PacketKind, Ping, Pong, RouteLayerPacket, RoutedPacket};
use crate::routing::{InboundFrameHandler, Router};

/// Delivery context of an inbound packet: who sent it, and over which session it
///  arrived. The session is [SessionId::P2P_SENTINEL] for packets that did not travel
///  over a real neighbor session (local loopback, reliable-transport delivery).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReceiveContext {
    pub from: NodeId,
    pub session: SessionId,
}

/// Persistent subscriber for one packet type.
#[async_trait]
pub trait PacketHandler<P: RoutedPacket>: Send + Sync + 'static {
    async fn on_packet(&self, packet: P, ctx: &ReceiveContext);
}

type Predicate<P> = Box<dyn Fn(&P, &ReceiveContext) -> bool + Send + Sync>;

struct OneShotListener<P> {
    id: u64,
    predicate: Predicate<P>,
    tx: Option<oneshot::Sender<P>>,
}

/// Per-kind dispatch state. Typed internally, stored type-erased in the dispatcher's
///  slot table.
struct KindSlot<P: RoutedPacket> {
    handler: RwLock<Option<Arc<dyn PacketHandler<P>>>>,
    listeners: Mutex<Vec<OneShotListener<P>>>,
}

impl<P: RoutedPacket> KindSlot<P> {
    fn new() -> KindSlot<P> {
        KindSlot {
            handler: Default::default(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    async fn add_listener(&self, id: u64, predicate: Predicate<P>, tx: oneshot::Sender<P>) {
        self.listeners.lock().await.push(OneShotListener {
            id,
            predicate,
            tx: Some(tx),
        });
    }

    async fn remove_listener(&self, id: u64) {
        self.listeners.lock().await.retain(|l| l.id != id);
    }

    #[cfg(test)]
    async fn num_listeners(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

#[async_trait]
trait ErasedSlot: Send + Sync + 'static {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    async fn on_body(&self, body: Bytes, ctx: ReceiveContext);
}

#[async_trait]
impl<P: RoutedPacket> ErasedSlot for KindSlot<P> {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    async fn on_body(&self, body: Bytes, ctx: ReceiveContext) {
        let mut buf: &[u8] = &body;
        let packet = match P::try_deser(&mut buf) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("undecodable {:?} packet from {:?} - dropping: {}", P::KIND, ctx.from, e);
                return;
            }
        };

        // the first matching one-shot listener wins; a match does not consume the packet,
        //  the persistent handler still runs afterwards
        {
            let mut listeners = self.listeners.lock().await;
            if let Some(listener) = listeners
                .iter_mut()
                .find(|l| l.tx.is_some() && (l.predicate)(&packet, &ctx))
            {
                trace!("one-shot listener {} matched a {:?} packet from {:?}", listener.id, P::KIND, ctx.from);
                if let Some(tx) = listener.tx.take() {
                    // the waiter may be gone already (cancellation raced the response)
                    let _ = tx.send(packet.clone());
                }
            }
            listeners.retain(|l| l.tx.is_some());
        }

        let handler = self.handler.read().await.clone();
        match handler {
            Some(handler) => handler.on_packet(packet, &ctx).await,
            None => trace!("no persistent handler for {:?} packets", P::KIND),
        }
    }
}

type SlotTable = Arc<RwLock<FxHashMap<PacketKind, Arc<dyn ErasedSlot>>>>;

/// The router-facing side of the dispatcher. It only shares the slot table with the
///  dispatcher itself, so handing it to the router does not create a reference cycle.
struct InboundDispatch {
    slots: SlotTable,
}

#[async_trait]
impl InboundFrameHandler for InboundDispatch {
    async fn on_packet(&self, packet: RouteLayerPacket, via: SessionId) {
        let slot = self.slots.read().await.get(&packet.kind).cloned();
        match slot {
            Some(slot) => {
                let ctx = ReceiveContext {
                    from: packet.from,
                    session: via,
                };
                slot.on_body(packet.body, ctx).await;
            }
            None => debug!("no subscriber for {:?} packets - dropping {:?}", packet.kind, packet),
        }
    }
}

/// Multiplexes typed packets over the router: fire-and-forget sends, one-shot
///  request/response exchanges, and persistent typed subscriptions.
pub struct RouterPacketDispatcher {
    router: Arc<Router>,
    slots: SlotTable,
    next_listener_id: AtomicU64,
}

impl RouterPacketDispatcher {
    /// Creates the dispatcher and registers it as the router's local frame handler.
    pub async fn new(router: Arc<Router>) -> Arc<RouterPacketDispatcher> {
        let slots: SlotTable = Default::default();
        router
            .set_local_handler(Arc::new(InboundDispatch { slots: slots.clone() }))
            .await;

        Arc::new(RouterPacketDispatcher {
            router,
            slots,
            next_listener_id: AtomicU64::new(0),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn self_id(&self) -> NodeId {
        self.router.self_id()
    }

    /// Fire-and-forget: encodes, wraps, hands to the router. Returns immediately with
    ///  no success indication - reliability, where needed, lives a layer up.
    pub async fn send<P: RoutedPacket>(&self, to: NodeId, packet: &P) {
        trace!("sending {:?} packet to {:?}", P::KIND, to);

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        self.router.send_packet(to, P::KIND, buf.freeze()).await;
    }

    /// Sends `req` and waits for the first inbound `Resp` (from any peer) that satisfies
    ///  `predicate`. Fails with [RequestError::Timeout] when the deadline elapses and
    ///  [RequestError::Cancelled] when the token fires; the listener is removed on every
    ///  terminal outcome.
    pub async fn send_and_listen_once<Req, Resp>(
        &self,
        to: NodeId,
        req: &Req,
        predicate: impl Fn(&Resp, &ReceiveContext) -> bool + Send + Sync + 'static,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Resp, RequestError>
    where
        Req: RoutedPacket,
        Resp: RoutedPacket,
    {
        let slot = self.slot_for::<Resp>().await;
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        // register before sending - the response must not be able to outrun the listener
        let (tx, rx) = oneshot::channel();
        slot.add_listener(listener_id, Box::new(predicate), tx).await;

        self.send(to, req).await;

        let result = if let Some(deadline) = deadline {
            select! {
                _ = cancel.cancelled() => Err(RequestError::Cancelled),
                _ = sleep(deadline) => Err(RequestError::Timeout),
                resp = rx => resp.map_err(|_| RequestError::Cancelled),
            }
        }
        else {
            select! {
                _ = cancel.cancelled() => Err(RequestError::Cancelled),
                resp = rx => resp.map_err(|_| RequestError::Cancelled),
            }
        };

        if result.is_err() {
            slot.remove_listener(listener_id).await;
        }
        result
    }

    /// Registers the persistent handler for inbound `P` packets, replacing any previous
    ///  one. Replacement (rather than rejection) is deliberate: reconnect flows
    ///  re-register their subscriptions.
    pub async fn on_receive<P: RoutedPacket>(&self, handler: Arc<dyn PacketHandler<P>>) {
        let slot = self.slot_for::<P>().await;
        let prev = slot.handler.write().await.replace(handler);
        if prev.is_some() {
            debug!("replacing the persistent handler for {:?} packets", P::KIND);
        }
    }

    async fn slot_for<P: RoutedPacket>(&self) -> Arc<KindSlot<P>> {
        if let Some(slot) = self.slots.read().await.get(&P::KIND) {
            return Self::downcast_slot(slot.clone());
        }

        let mut slots = self.slots.write().await;
        let slot = slots
            .entry(P::KIND)
            .or_insert_with(|| Arc::new(KindSlot::<P>::new()) as Arc<dyn ErasedSlot>)
            .clone();
        Self::downcast_slot(slot)
    }

    fn downcast_slot<P: RoutedPacket>(slot: Arc<dyn ErasedSlot>) -> Arc<KindSlot<P>> {
        slot.as_any_arc()
            .downcast::<KindSlot<P>>()
            .expect("two packet types registered with the same kind")
    }
}

/// Answers inbound [Ping]s with [Pong]s. Holds the dispatcher weakly - the dispatcher
///  owns this handler through its slot table, a strong reference would cycle.
struct PingResponder {
    dispatcher: Weak<RouterPacketDispatcher>,
}

#[async_trait]
impl PacketHandler<Ping> for PingResponder {
    async fn on_packet(&self, _packet: Ping, ctx: &ReceiveContext) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            trace!("answering ping from {:?}", ctx.from);
            dispatcher.send(ctx.from, &Pong).await;
        }
    }
}

pub async fn register_ping_responder(dispatcher: &Arc<RouterPacketDispatcher>) {
    dispatcher
        .on_receive::<Ping>(Arc::new(PingResponder {
            dispatcher: Arc::downgrade(dispatcher),
        }))
        .await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::time;

    use crate::config::TransportConfig;
    use crate::packets::{HeartBeat, Pong, TransDatagram};
    use crate::routing::MockNeighborLink;

    use super::*;

    struct RecordingHandler<P> {
        seen: Mutex<Vec<(P, NodeId, SessionId)>>,
    }

    impl<P: RoutedPacket> RecordingHandler<P> {
        fn new() -> Arc<RecordingHandler<P>> {
            Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl<P: RoutedPacket> PacketHandler<P> for RecordingHandler<P> {
        async fn on_packet(&self, packet: P, ctx: &ReceiveContext) {
            self.seen.lock().await.push((packet, ctx.from, ctx.session));
        }
    }

    async fn test_dispatcher() -> (Arc<Router>, Arc<RouterPacketDispatcher>) {
        let router = Arc::new(Router::new(NodeId(1), Arc::new(TransportConfig::new())));
        let dispatcher = RouterPacketDispatcher::new(router.clone()).await;
        (router, dispatcher)
    }

    fn frame_to_self<P: RoutedPacket>(from: u128, seq: u32, packet: &P) -> Vec<u8> {
        let mut body = BytesMut::new();
        packet.ser(&mut body);
        let frame = RouteLayerPacket {
            from: NodeId(from),
            to: NodeId(1),
            ttl: 16,
            seq,
            kind: P::KIND,
            body: body.freeze(),
        };
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_persistent_handler_receives_typed_packets() {
        let (router, dispatcher) = test_dispatcher().await;

        let handler = RecordingHandler::<TransDatagram>::new();
        dispatcher.on_receive::<TransDatagram>(handler.clone()).await;

        let datagram = TransDatagram::ack(7);
        router.handle_frame(SessionId(4), &frame_to_self(2, 0, &datagram)).await;

        let seen = handler.seen.lock().await;
        assert_eq!(seen.as_slice(), &[(datagram, NodeId(2), SessionId(4))]);
    }

    #[tokio::test]
    async fn test_unsubscribed_kind_is_dropped() {
        let (router, _dispatcher) = test_dispatcher().await;
        router.handle_frame(SessionId(4), &frame_to_self(2, 0, &HeartBeat)).await;
    }

    #[tokio::test]
    async fn test_send_encodes_and_routes() {
        let (router, dispatcher) = test_dispatcher().await;

        let mut link = MockNeighborLink::new();
        link.expect_id().return_const(SessionId(5));
        link.expect_send_frame()
            .withf(|raw| {
                let mut b: &[u8] = raw;
                let frame = RouteLayerPacket::try_deser(&mut b).unwrap();
                let mut body: &[u8] = &frame.body;
                frame.kind == TransDatagram::KIND
                    && TransDatagram::try_deser(&mut body).unwrap() == TransDatagram::ack(3)
            })
            .once()
            .returning(|_| Ok(()));
        router.attach_neighbor(Arc::new(link)).await;
        router.set_route(NodeId(9), SessionId(5)).await;

        dispatcher.send(NodeId(9), &TransDatagram::ack(3)).await;
    }

    #[tokio::test]
    async fn test_send_and_listen_once_matches() {
        let (router, dispatcher) = test_dispatcher().await;

        let router_inject = router.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            // a non-matching response first, then the match
            router_inject.handle_frame(SessionId(4), &frame_to_self(2, 0, &TransDatagram::ack(9))).await;
            router_inject.handle_frame(SessionId(4), &frame_to_self(2, 1, &TransDatagram::ack(3))).await;
        });

        let response = dispatcher
            .send_and_listen_once::<HeartBeat, TransDatagram>(
                NodeId(2),
                &HeartBeat,
                |resp, _ctx| resp.syn_or_ack == 3,
                Some(Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response, TransDatagram::ack(3));

        assert_eq!(dispatcher.slot_for::<TransDatagram>().await.num_listeners().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_listen_once_times_out() {
        let (_router, dispatcher) = test_dispatcher().await;

        let result = dispatcher
            .send_and_listen_once::<HeartBeat, TransDatagram>(
                NodeId(2),
                &HeartBeat,
                |_, _| true,
                Some(Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result, Err(RequestError::Timeout));

        assert_eq!(dispatcher.slot_for::<TransDatagram>().await.num_listeners().await, 0);
    }

    #[tokio::test]
    async fn test_send_and_listen_once_observes_cancellation() {
        let (_router, dispatcher) = test_dispatcher().await;

        let cancel = CancellationToken::new();
        let cancel_trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(5)).await;
            cancel_trigger.cancel();
        });

        let result = dispatcher
            .send_and_listen_once::<HeartBeat, TransDatagram>(
                NodeId(2),
                &HeartBeat,
                |_, _| true,
                None,
                &cancel,
            )
            .await;
        assert_eq!(result, Err(RequestError::Cancelled));

        assert_eq!(dispatcher.slot_for::<TransDatagram>().await.num_listeners().await, 0);
    }

    #[tokio::test]
    async fn test_match_does_not_consume_from_persistent_handler() {
        let (router, dispatcher) = test_dispatcher().await;

        let handler = RecordingHandler::<TransDatagram>::new();
        dispatcher.on_receive::<TransDatagram>(handler.clone()).await;

        let router_inject = router.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            router_inject.handle_frame(SessionId(4), &frame_to_self(2, 0, &TransDatagram::ack(3))).await;
        });

        dispatcher
            .send_and_listen_once::<HeartBeat, TransDatagram>(
                NodeId(2),
                &HeartBeat,
                |resp, _| resp.syn_or_ack == 3,
                Some(Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(handler.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_on_receive_replaces_handler() {
        let (router, dispatcher) = test_dispatcher().await;

        let first = RecordingHandler::<TransDatagram>::new();
        let second = RecordingHandler::<TransDatagram>::new();
        dispatcher.on_receive::<TransDatagram>(first.clone()).await;
        dispatcher.on_receive::<TransDatagram>(second.clone()).await;

        router.handle_frame(SessionId(4), &frame_to_self(2, 0, &TransDatagram::ack(1))).await;

        assert_eq!(first.seen.lock().await.len(), 0);
        assert_eq!(second.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ping_responder() {
        let (router, dispatcher) = test_dispatcher().await;
        register_ping_responder(&dispatcher).await;

        let mut link = MockNeighborLink::new();
        link.expect_id().return_const(SessionId(5));
        link.expect_send_frame()
            .withf(|raw| {
                let mut b: &[u8] = raw;
                RouteLayerPacket::try_deser(&mut b).unwrap().kind == Pong::KIND
            })
            .once()
            .returning(|_| Ok(()));
        router.attach_neighbor(Arc::new(link)).await;
        router.set_route(NodeId(2), SessionId(5)).await;

        router.handle_frame(SessionId(5), &frame_to_self(2, 0, &Ping)).await;
    }
}
