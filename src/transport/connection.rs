use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::dispatch::RouterPacketDispatcher;
use crate::error::{ConnectionError, RequestError};
use crate::node_id::{NodeId, SessionId};
use crate::packets::{DatagramFlags, P2pPacket, TransDatagram, BUFFER_LENGTH};
use crate::transport::registry::AppMessageHandler;

/// Reliable ordered stream to one peer.
///
/// All window state lives behind a single lock: the application writer, the inbound
///  datagram handler and the retransmission task are the only writers, and they
///  serialize on it. Nothing in here is shared between different connections.
pub struct P2PConnection {
    peer: NodeId,
    dispatcher: Arc<RouterPacketDispatcher>,
    app_handler: Arc<dyn AppMessageHandler>,
    config: Arc<TransportConfig>,
    shutdown: CancellationToken,
    inner: RwLock<ConnectionInner>,
}

struct ConnectionInner {
    is_connected: bool,

    /// Slot `i` is true once the ACK for the datagram in slot `i` has arrived. Bits are
    ///  cleared again as `ack_pointer` consumes them.
    send_buffer_ack: [bool; BUFFER_LENGTH],

    /// Original payload per occupied slot, kept for retransmission until the slot's ACK
    ///  advances `ack_pointer` past it.
    retained: FxHashMap<u16, Bytes>,

    /// Next slot to assign to an outgoing datagram.
    send_pointer: u16,

    /// Oldest slot still awaiting its ACK. The pending window is the ring segment
    ///  `[ack_pointer, send_pointer)`.
    ack_pointer: u16,

    last_ack_time: Instant,

    /// Recently dispatched inbound SYN slots, for duplicate suppression. Capacity is one
    ///  less than the ring so a slot legitimately reused after a full wrap has been
    ///  evicted by the traffic in between and is not mistaken for a retransmit.
    recent_syn: LruCache<u16, ()>,
}

impl ConnectionInner {
    fn new() -> ConnectionInner {
        ConnectionInner {
            is_connected: false,
            send_buffer_ack: [false; BUFFER_LENGTH],
            retained: FxHashMap::default(),
            send_pointer: 0,
            ack_pointer: 0,
            last_ack_time: Instant::now(),
            recent_syn: LruCache::new(NonZeroUsize::new(BUFFER_LENGTH - 1).expect("ring is bigger than 1")),
        }
    }

    fn reset(&mut self) {
        self.is_connected = false;
        self.send_buffer_ack = [false; BUFFER_LENGTH];
        self.retained.clear();
        self.send_pointer = 0;
        self.ack_pointer = 0;
        self.last_ack_time = Instant::now();
        self.recent_syn.clear();
    }

    fn is_in_window(&self, slot: u16) -> bool {
        if self.ack_pointer <= self.send_pointer {
            slot >= self.ack_pointer && slot < self.send_pointer
        }
        else {
            slot >= self.ack_pointer || slot < self.send_pointer
        }
    }

    fn window_is_full(&self) -> bool {
        (self.send_pointer + 1) % BUFFER_LENGTH as u16 == self.ack_pointer
    }
}

impl P2PConnection {
    pub(crate) fn new(
        peer: NodeId,
        dispatcher: Arc<RouterPacketDispatcher>,
        app_handler: Arc<dyn AppMessageHandler>,
        config: Arc<TransportConfig>,
        parent_shutdown: &CancellationToken,
    ) -> Arc<P2PConnection> {
        let connection = Arc::new(P2PConnection {
            peer,
            dispatcher,
            app_handler,
            config,
            shutdown: parent_shutdown.child_token(),
            inner: RwLock::new(ConnectionInner::new()),
        });
        connection.spawn_resend_loop();
        connection
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.is_connected
    }

    /// Fill level of the send window: payloads handed to [P2PConnection::send] whose
    ///  ACK has not yet advanced the window past them. Zero means everything sent so
    ///  far is acknowledged.
    pub async fn num_pending(&self) -> usize {
        let inner = self.inner.read().await;
        (inner.send_pointer as usize + BUFFER_LENGTH - inner.ack_pointer as usize) % BUFFER_LENGTH
    }

    #[cfg(test)]
    pub(crate) async fn window_pointers(&self) -> (u16, u16) {
        let inner = self.inner.read().await;
        (inner.ack_pointer, inner.send_pointer)
    }

    /// Initiator side of the three-way handshake. Succeeds once the peer's handshake
    ///  response arrives; fails without any state mutation on timeout.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.inner.read().await.is_connected {
            return Ok(());
        }

        debug!("initiating handshake with {:?}", self.peer);
        let peer = self.peer;
        let response = self
            .dispatcher
            .send_and_listen_once::<TransDatagram, TransDatagram>(
                peer,
                &TransDatagram::first_handshake(),
                move |resp, ctx| {
                    ctx.from == peer
                        && resp.flag == DatagramFlags::SECOND_HANDSHAKE
                        && resp.syn_or_ack == 1
                },
                Some(self.config.handshake_timeout),
                &self.shutdown,
            )
            .await;

        match response {
            Ok(_) => {
                self.dispatcher.send(peer, &TransDatagram::third_handshake()).await;
                self.inner.write().await.is_connected = true;
                info!("connected to {:?}", self.peer);
                Ok(())
            }
            Err(RequestError::Timeout) => {
                debug!("handshake with {:?} timed out", self.peer);
                Err(ConnectionError::HandshakeTimeout(peer))
            }
            Err(RequestError::Cancelled) => Err(ConnectionError::Closed),
        }
    }

    /// Hands `message` to the reliable delivery machinery: it occupies a window slot
    ///  until the peer ACKs it, and is resent while it does not.
    ///
    /// Fire-and-forget beyond window admission: there is no delivery notification.
    pub async fn send(&self, message: &[u8]) -> Result<(), ConnectionError> {
        let payload = P2pPacket::encode(message);

        let datagram = {
            let mut inner = self.inner.write().await;
            if !inner.is_connected {
                return Err(ConnectionError::NotConnected(self.peer));
            }
            if inner.window_is_full() {
                return Err(ConnectionError::WindowFull(self.peer));
            }

            let slot = inner.send_pointer;
            inner.send_buffer_ack[slot as usize] = false;
            inner.retained.insert(slot, payload.clone());
            inner.send_pointer = (slot + 1) % BUFFER_LENGTH as u16;

            TransDatagram::data(slot, payload)
        };

        trace!("sending {:?} to {:?}", datagram, self.peer);
        self.dispatcher.send(self.peer, &datagram).await;
        Ok(())
    }

    /// Sends a best-effort FIN, clears all window state and stops this connection's
    ///  tasks. The registry removes the entry separately.
    pub async fn disconnect(&self) {
        debug!("disconnecting from {:?}", self.peer);
        if self.inner.read().await.is_connected {
            self.dispatcher.send(self.peer, &TransDatagram::fin()).await;
        }
        self.inner.write().await.reset();
        self.shutdown.cancel();
    }

    pub(crate) async fn on_datagram(&self, datagram: TransDatagram) {
        if datagram.flag.contains(DatagramFlags::CON) {
            self.on_handshake(datagram).await;
        }
        else if datagram.flag.contains(DatagramFlags::FIN) {
            debug!("FIN from {:?} - resetting connection state", self.peer);
            self.inner.write().await.reset();
        }
        else if datagram.flag.contains(DatagramFlags::SYN) {
            self.on_data(datagram).await;
        }
        else if datagram.flag.contains(DatagramFlags::ACK) {
            self.on_ack(datagram.syn_or_ack).await;
        }
        else {
            warn!("datagram without actionable flags from {:?} - ignoring {:?}", self.peer, datagram);
        }
    }

    async fn on_handshake(&self, datagram: TransDatagram) {
        match datagram.flag {
            f if f == DatagramFlags::FIRST_HANDSHAKE => {
                debug!("handshake request from {:?}", self.peer);
                // optimistically connected: the peer's first data frame proves liveness
                //  anyway, and will be ACKed like any other
                self.inner.write().await.is_connected = true;
                self.dispatcher.send(self.peer, &TransDatagram::second_handshake()).await;
            }
            f if f == DatagramFlags::SECOND_HANDSHAKE => {
                // matched by the one-shot listener inside connect()
                trace!("handshake response from {:?}", self.peer);
            }
            f if f == DatagramFlags::THIRD_HANDSHAKE => {
                // informational: the initiator is connected either way
                debug!("handshake with {:?} confirmed", self.peer);
            }
            _ => warn!("malformed handshake datagram from {:?} - ignoring {:?}", self.peer, datagram),
        }
    }

    async fn on_data(&self, datagram: TransDatagram) {
        let slot = datagram.syn_or_ack;

        let duplicate = self.inner.write().await.recent_syn.put(slot, ()).is_some();
        if duplicate {
            trace!("retransmitted slot {} from {:?} - ACKing without dispatch", slot, self.peer);
        }
        else {
            match &datagram.payload {
                Some(payload) => match P2pPacket::decode(payload) {
                    Ok(message) => {
                        self.app_handler
                            .on_message(self.peer, SessionId::P2P_SENTINEL, &message)
                            .await;
                    }
                    Err(e) => {
                        warn!("undecodable payload in slot {} from {:?} - ACKing anyway: {}", slot, self.peer, e);
                    }
                },
                None => warn!("data frame without payload in slot {} from {:?}", slot, self.peer),
            }
        }

        // the ACK acknowledges receipt of the bytes, not their successful processing
        self.dispatcher.send(self.peer, &TransDatagram::ack(slot)).await;
    }

    async fn on_ack(&self, slot: u16) {
        let mut inner = self.inner.write().await;

        if !inner.is_in_window(slot) {
            trace!("ACK for slot {} outside the pending window from {:?} - ignoring", slot, self.peer);
            return;
        }

        inner.send_buffer_ack[slot as usize] = true;

        if slot == inner.ack_pointer {
            inner.last_ack_time = Instant::now();
            while inner.ack_pointer != inner.send_pointer
                && inner.send_buffer_ack[inner.ack_pointer as usize]
            {
                let consumed = inner.ack_pointer;
                inner.send_buffer_ack[consumed as usize] = false;
                inner.retained.remove(&consumed);
                inner.ack_pointer = (consumed + 1) % BUFFER_LENGTH as u16;
            }
            trace!("ACK advanced window of {:?} to [{}, {})", self.peer, inner.ack_pointer, inner.send_pointer);
        }
    }

    fn spawn_resend_loop(self: &Arc<Self>) {
        let connection = self.clone();
        tokio::spawn(async move {
            loop {
                select! {
                    _ = connection.shutdown.cancelled() => break,
                    _ = sleep(connection.config.resend_poll_interval) => {
                        connection.resend_pending().await
                    }
                }
            }
            trace!("retransmission task for {:?} stopped", connection.peer);
        });
    }

    async fn resend_pending(&self) {
        let pending = {
            let mut inner = self.inner.write().await;
            if inner.ack_pointer == inner.send_pointer {
                return;
            }
            if inner.last_ack_time.elapsed() <= self.config.resend_timeout {
                return;
            }

            let mut pending = Vec::new();
            let mut slot = inner.ack_pointer;
            while slot != inner.send_pointer {
                if !inner.send_buffer_ack[slot as usize] {
                    match inner.retained.get(&slot) {
                        Some(payload) => pending.push((slot, payload.clone())),
                        None => warn!("no retained payload for pending slot {} towards {:?}", slot, self.peer),
                    }
                }
                slot = (slot + 1) % BUFFER_LENGTH as u16;
            }

            inner.last_ack_time = Instant::now();
            pending
        };

        debug!("resending {} pending slots to {:?}", pending.len(), self.peer);
        for (slot, payload) in pending {
            self.dispatcher.send(self.peer, &TransDatagram::data(slot, payload)).await;
        }
    }
}
