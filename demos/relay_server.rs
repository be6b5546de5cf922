//! A standalone relay node: accepts TCP sessions, forwards routed frames between them,
//!  and evicts sessions whose heartbeats stop.
//!
//! Exits 0 on interrupt, non-zero when startup fails (e.g. the listen port is taken).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use roomnet::config::{RelayServerConfig, TransportConfig};
use roomnet::dispatch::{register_ping_responder, RouterPacketDispatcher};
use roomnet::net::{SessionIdAllocator, TcpSession};
use roomnet::node_id::{NodeId, SessionId};
use roomnet::relay::{RelayControl, RelaySessionEvents, RelaySessionManager, SessionDirectory};
use roomnet::routing::Router;

struct LoggingEvents;

#[async_trait]
impl RelaySessionEvents for LoggingEvents {
    async fn on_session_disconnected(&self, session: SessionId) {
        info!("session {:?} disconnected", session);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();

    let relay_config = RelayServerConfig::new();
    let config = Arc::new(TransportConfig::new());
    config.validate()?;

    let shutdown = CancellationToken::new();
    let self_id = NodeId::generate();
    let router = Arc::new(Router::new(self_id, config.clone()));
    let dispatcher = RouterPacketDispatcher::new(router.clone()).await;
    register_ping_responder(&dispatcher).await;

    let manager = RelaySessionManager::new(config.clone(), Arc::new(LoggingEvents), shutdown.clone());
    let directory = SessionDirectory::new();
    RelayControl::register(&dispatcher, manager.clone(), directory.clone()).await;
    manager.spawn_watchdog();

    let listener = TcpListener::bind(relay_config.listen_addr()).await?;
    info!(
        "relay {:?} listening on {}, advertising {}",
        self_id,
        relay_config.listen_addr(),
        relay_config.advertised_addr(),
    );

    let allocator = SessionIdAllocator::new();
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted - shutting down");
                shutdown.cancel();
                break;
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let id = allocator.next();
                info!("accepted connection from {} as session {:?}", addr, id);

                let session = TcpSession::spawn(id, stream, router.clone(), config.max_frame_size, &shutdown);
                router.attach_neighbor(session.clone()).await;
                directory.insert(session.clone()).await;
                if manager.attach(id, session).await.is_none() {
                    info!("session {:?} was already attached", id);
                }
            }
        }
    }

    Ok(())
}
