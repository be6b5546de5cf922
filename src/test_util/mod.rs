//! In-memory wiring for tests and demos: complete node bundles connected through
//!  channel-backed neighbor links, with optional scripted frame loss.
//!
//! This is regular (non-`#[cfg(test)]`) code so that integration tests and the demo
//!  binaries can use the same harness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::TransportConfig;
use crate::dispatch::RouterPacketDispatcher;
use crate::node_id::{NodeId, SessionId};
use crate::routing::{NeighborLink, Router};
use crate::transport::{AppMessageHandler, ConnectionRegistry};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1000);

/// Decides, by 0-based frame index on a link, whether that frame is silently dropped.
pub type DropFn = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// Collects everything the transport delivers to the application.
pub struct RecordingApp {
    messages: Mutex<Vec<(NodeId, Vec<u8>)>>,
    notify: Notify,
}

impl RecordingApp {
    pub fn new() -> Arc<RecordingApp> {
        Arc::new(RecordingApp {
            messages: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().await.iter().map(|(_, m)| m.clone()).collect()
    }

    pub async fn num_messages(&self) -> usize {
        self.messages.lock().await.len()
    }

    /// Resolves when the next message after the call arrives.
    pub async fn wait_for_message(&self) {
        self.notify.notified().await;
    }
}

#[async_trait]
impl AppMessageHandler for RecordingApp {
    async fn on_message(&self, from: NodeId, _session: SessionId, message: &[u8]) {
        self.messages.lock().await.push((from, message.to_vec()));
        self.notify.notify_waiters();
    }
}

/// A full node: router, dispatcher, connection registry, and a recording application
///  sink.
pub struct TestNode {
    pub id: NodeId,
    pub config: Arc<TransportConfig>,
    pub router: Arc<Router>,
    pub dispatcher: Arc<RouterPacketDispatcher>,
    pub connections: Arc<ConnectionRegistry>,
    pub app: Arc<RecordingApp>,
    pub shutdown: CancellationToken,
}

impl TestNode {
    pub async fn new(id: u128) -> TestNode {
        let config = Arc::new(TransportConfig::new());
        let shutdown = CancellationToken::new();
        let router = Arc::new(Router::new(NodeId(id), config.clone()));
        let dispatcher = RouterPacketDispatcher::new(router.clone()).await;
        let app = RecordingApp::new();
        let connections = ConnectionRegistry::new(
            dispatcher.clone(),
            config.clone(),
            app.clone(),
            shutdown.clone(),
        )
        .await;

        TestNode {
            id: NodeId(id),
            config,
            router,
            dispatcher,
            connections,
            app,
            shutdown,
        }
    }
}

struct ChannelLink {
    id: SessionId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    drop_fn: Option<DropFn>,
    frame_counter: AtomicU64,
}

#[async_trait]
impl NeighborLink for ChannelLink {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn send_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        let index = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        if let Some(drop_fn) = &self.drop_fn {
            if drop_fn(index) {
                return Ok(());
            }
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| anyhow::anyhow!("link {:?} is closed", self.id))
    }
}

/// Wires a bidirectional lossless link between two nodes and installs direct routes.
pub async fn link(a: &TestNode, b: &TestNode) {
    link_with_loss(a, b, None, None).await;
}

/// Like [link], with an optional loss script per direction.
pub async fn link_with_loss(
    a: &TestNode,
    b: &TestNode,
    a_to_b_drop: Option<DropFn>,
    b_to_a_drop: Option<DropFn>,
) {
    wire_direction(a, b, a_to_b_drop).await;
    wire_direction(b, a, b_to_a_drop).await;
}

async fn wire_direction(from: &TestNode, to: &TestNode, drop_fn: Option<DropFn>) {
    let session = SessionId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed));
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let receiver = to.router.clone();
    let cancel = to.shutdown.clone();
    tokio::spawn(async move {
        loop {
            select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => receiver.handle_frame(session, &frame).await,
                    None => break,
                },
            }
        }
    });

    from.router
        .attach_neighbor(Arc::new(ChannelLink {
            id: session,
            tx,
            drop_fn,
            frame_counter: AtomicU64::new(0),
        }))
        .await;
    from.router.set_route(to.id, session).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::dispatch::register_ping_responder;
    use crate::packets::{Ping, Pong};

    use super::*;

    #[tokio::test]
    async fn test_linked_nodes_exchange_packets() {
        let a = TestNode::new(1).await;
        let b = TestNode::new(2).await;
        link(&a, &b).await;

        register_ping_responder(&b.dispatcher).await;

        let response = a
            .dispatcher
            .send_and_listen_once::<Ping, Pong>(
                b.id,
                &Ping,
                |_, ctx| ctx.from == NodeId(2),
                Some(Duration::from_secs(1)),
                &CancellationToken::new(),
            )
            .await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_drop_script_suppresses_frames() {
        let a = TestNode::new(1).await;
        let b = TestNode::new(2).await;
        // drop everything a sends
        link_with_loss(&a, &b, Some(Arc::new(|_| true)), None).await;

        a.dispatcher.send(b.id, &Ping).await;
        tokio::task::yield_now().await;
        assert_eq!(b.app.num_messages().await, 0);
    }
}
