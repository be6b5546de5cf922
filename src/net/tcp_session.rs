use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::node_id::{NodeId, SessionId};
use crate::packets::{HeartBeat, PacketKind, RouteLayerPacket, RoutedPacket, ShutdownMessage};
use crate::relay::RelaySession;
use crate::routing::{NeighborLink, Router};

/// Control frames go exactly one hop, to the node at the other end of this session.
const DIRECT_CONTROL_TTL: u8 = 1;

/// A neighbor session over a TCP stream. Frames are 4-byte big-endian length-prefixed.
///
/// Outbound frames are enqueued on an unbounded channel and written by a background
///  task, so sending never suspends the caller. Inbound frames are parsed and handed to
///  the router; the origin of the first inbound frame is remembered as the peer's node
///  id for link-local control traffic.
pub struct TcpSession {
    id: SessionId,
    router: Arc<Router>,
    max_frame_size: usize,
    peer_node: RwLock<Option<NodeId>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

impl TcpSession {
    pub fn spawn(
        id: SessionId,
        stream: TcpStream,
        router: Arc<Router>,
        max_frame_size: usize,
        shutdown: &CancellationToken,
    ) -> Arc<TcpSession> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Arc::new(TcpSession {
            id,
            router,
            max_frame_size,
            peer_node: Default::default(),
            out_tx,
            cancel: shutdown.child_token(),
        });

        let (read_half, write_half) = stream.into_split();
        session.spawn_write_loop(write_half, out_rx);
        session.spawn_read_loop(read_half);
        session
    }

    pub async fn peer_node(&self) -> Option<NodeId> {
        *self.peer_node.read().await
    }

    fn spawn_write_loop(
        self: &Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = select! {
                    _ = session.cancel.cancelled() => break,
                    frame = out_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };

                let result: anyhow::Result<()> = async {
                    write_half.write_all(&(frame.len() as u32).to_be_bytes()).await?;
                    write_half.write_all(&frame).await?;
                    Ok(())
                }
                .await;

                if let Err(e) = result {
                    debug!("write on session {:?} failed - closing: {}", session.id, e);
                    session.teardown().await;
                    break;
                }
            }
            trace!("write loop of session {:?} stopped", session.id);
        });
    }

    fn spawn_read_loop(self: &Arc<Self>, mut read_half: OwnedReadHalf) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let frame = select! {
                    _ = session.cancel.cancelled() => break,
                    frame = read_frame(&mut read_half, session.max_frame_size) => frame,
                };

                match frame {
                    Ok(frame) => session.on_frame(&frame).await,
                    Err(e) => {
                        debug!("session {:?} closed: {}", session.id, e);
                        session.teardown().await;
                        break;
                    }
                }
            }
            trace!("read loop of session {:?} stopped", session.id);
        });
    }

    async fn on_frame(&self, frame: &[u8]) {
        let mut buf = frame;
        let packet = match RouteLayerPacket::try_deser(&mut buf) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("unparseable frame on session {:?} - dropping: {}", self.id, e);
                return;
            }
        };

        if self.peer_node.read().await.is_none() && !packet.from.is_unset() {
            debug!("session {:?} belongs to {:?}", self.id, packet.from);
            *self.peer_node.write().await = Some(packet.from);
        }

        self.router.handle_packet(self.id, packet).await;
    }

    async fn teardown(&self) {
        self.router.detach_neighbor(self.id).await;
        self.cancel.cancel();
    }

    /// Builds and enqueues a link-local control frame addressed to the session's peer.
    async fn send_control(&self, kind: PacketKind) -> anyhow::Result<()> {
        let Some(peer) = self.peer_node().await else {
            bail!("peer identity of session {:?} is not yet known", self.id);
        };

        let packet = RouteLayerPacket {
            from: self.router.self_id(),
            to: peer,
            ttl: DIRECT_CONTROL_TTL,
            seq: self.router.allocate_seq(),
            kind,
            body: Bytes::new(),
        };

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        self.enqueue_frame(&buf)
    }

    fn enqueue_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.out_tx
            .send(frame.to_vec())
            .map_err(|_| anyhow!("session {:?} is closed", self.id))
    }
}

async fn read_frame(read_half: &mut OwnedReadHalf, max_frame_size: usize) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let frame_len = u32::from_be_bytes(len_buf) as usize;

    if frame_len > max_frame_size {
        bail!(
            "frame of {} bytes exceeds the limit of {} - the session is apparently compromised",
            frame_len,
            max_frame_size,
        );
    }

    let mut frame = vec![0u8; frame_len];
    read_half.read_exact(&mut frame).await?;
    Ok(frame)
}

#[async_trait]
impl NeighborLink for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.enqueue_frame(frame)
    }
}

#[async_trait]
impl RelaySession for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn send_heartbeat(&self) -> anyhow::Result<()> {
        self.send_control(HeartBeat::KIND).await
    }

    async fn send_shutdown(&self) -> anyhow::Result<()> {
        self.send_control(ShutdownMessage::KIND).await
    }

    async fn close(&self) {
        debug!("closing session {:?}", self.id);
        self.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use crate::config::TransportConfig;
    use crate::dispatch::{PacketHandler, ReceiveContext, RouterPacketDispatcher};
    use crate::packets::Ping;
    use tokio::sync::Mutex;

    use super::*;

    struct RecordingPings {
        seen: Mutex<Vec<NodeId>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl PacketHandler<Ping> for RecordingPings {
        async fn on_packet(&self, _packet: Ping, ctx: &ReceiveContext) {
            self.seen.lock().await.push(ctx.from);
            self.notify.notify_one();
        }
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn node(id: u128) -> (Arc<Router>, Arc<RouterPacketDispatcher>) {
        let router = Arc::new(Router::new(NodeId(id), Arc::new(TransportConfig::new())));
        let dispatcher = RouterPacketDispatcher::new(router.clone()).await;
        (router, dispatcher)
    }

    #[tokio::test]
    async fn test_frames_cross_the_wire() {
        let (client_stream, server_stream) = tcp_pair().await;
        let (client_router, client_dispatcher) = node(1).await;
        let (server_router, server_dispatcher) = node(2).await;

        let shutdown = CancellationToken::new();
        let client_session = TcpSession::spawn(SessionId(1), client_stream, client_router.clone(), 1024 * 1024, &shutdown);
        let server_session = TcpSession::spawn(SessionId(2), server_stream, server_router.clone(), 1024 * 1024, &shutdown);

        client_router.attach_neighbor(client_session.clone()).await;
        client_router.set_route(NodeId(2), SessionId(1)).await;
        server_router.attach_neighbor(server_session.clone()).await;
        server_router.set_route(NodeId(1), SessionId(2)).await;

        let handler = Arc::new(RecordingPings {
            seen: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        server_dispatcher.on_receive::<Ping>(handler.clone()).await;

        client_dispatcher.send(NodeId(2), &Ping).await;

        timeout(Duration::from_secs(2), handler.notify.notified()).await.unwrap();
        assert_eq!(handler.seen.lock().await.as_slice(), &[NodeId(1)]);

        // the server learned the client's identity from the first frame
        assert_eq!(server_session.peer_node().await, Some(NodeId(1)));

        // the reverse direction works too, via the learned identity
        let back = Arc::new(RecordingPings {
            seen: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        });
        client_dispatcher.on_receive::<Ping>(back.clone()).await;
        server_dispatcher.send(NodeId(1), &Ping).await;
        timeout(Duration::from_secs(2), back.notify.notified()).await.unwrap();
    }

    #[tokio::test]
    async fn test_control_send_requires_known_peer() {
        let (client_stream, _server_stream) = tcp_pair().await;
        let (client_router, _) = node(1).await;

        let shutdown = CancellationToken::new();
        let session = TcpSession::spawn(SessionId(1), client_stream, client_router, 1024, &shutdown);

        // no inbound frame yet, the peer's node id is unknown
        assert!(session.send_heartbeat().await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_detaches_from_router() {
        let (client_stream, server_stream) = tcp_pair().await;
        let (client_router, _) = node(1).await;

        let shutdown = CancellationToken::new();
        let session = TcpSession::spawn(SessionId(1), client_stream, client_router.clone(), 1024, &shutdown);
        client_router.attach_neighbor(session.clone()).await;
        client_router.set_route(NodeId(2), SessionId(1)).await;

        drop(server_stream);

        timeout(Duration::from_secs(2), session.cancel.cancelled()).await.unwrap();

        // once the write loop has wound down, sends fail fast
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.send_frame(b"frame").await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_session() {
        let (client_stream, mut server_stream) = tcp_pair().await;
        let (client_router, _) = node(1).await;

        let shutdown = CancellationToken::new();
        let session = TcpSession::spawn(SessionId(1), client_stream, client_router, 64, &shutdown);

        // announce a frame far beyond the limit
        server_stream.write_all(&(1024u32 * 1024).to_be_bytes()).await.unwrap();

        timeout(Duration::from_secs(2), session.cancel.cancelled()).await.unwrap();
    }
}
