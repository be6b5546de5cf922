//! Relay-side session liveness.
//!
//! The relay does not reassemble reliable streams, it forwards routed frames between
//!  its attached sessions. What it does own is per-session liveness: every attached
//!  session is tracked by the [RelaySessionManager]'s watchdog and evicted when its
//!  heartbeats stop.

mod keepalive;
mod session_manager;

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::dispatch::{PacketHandler, ReceiveContext, RouterPacketDispatcher};
use crate::node_id::SessionId;
use crate::packets::{HeartBeat, ShutdownMessage};

pub use keepalive::spawn_keepalive;
pub use session_manager::{RelaySession, RelaySessionEvents, RelaySessionManager};

#[cfg(test)]
pub use session_manager::{MockRelaySession, MockRelaySessionEvents};

/// Lookup from session handle to the session object. The network layer registers
///  sessions here as they are accepted, the control handlers resolve inbound heartbeats
///  against it.
pub struct SessionDirectory {
    links: RwLock<FxHashMap<SessionId, Arc<dyn RelaySession>>>,
}

impl SessionDirectory {
    pub fn new() -> Arc<SessionDirectory> {
        Arc::new(SessionDirectory { links: Default::default() })
    }

    pub async fn insert(&self, session: Arc<dyn RelaySession>) {
        self.links.write().await.insert(session.id(), session);
    }

    pub async fn remove(&self, id: SessionId) {
        self.links.write().await.remove(&id);
    }

    pub async fn get(&self, id: SessionId) -> Option<Arc<dyn RelaySession>> {
        self.links.read().await.get(&id).cloned()
    }
}

/// Subscribes the relay's control-packet handling on the dispatcher: heartbeats feed
///  the session manager, shutdown messages remove sessions.
pub struct RelayControl {
    manager: Arc<RelaySessionManager>,
    directory: Arc<SessionDirectory>,
}

impl RelayControl {
    pub async fn register(
        dispatcher: &Arc<RouterPacketDispatcher>,
        manager: Arc<RelaySessionManager>,
        directory: Arc<SessionDirectory>,
    ) {
        let control = Arc::new(RelayControl { manager, directory });
        dispatcher.on_receive::<HeartBeat>(control.clone()).await;
        dispatcher.on_receive::<ShutdownMessage>(control).await;
    }
}

#[async_trait]
impl PacketHandler<HeartBeat> for RelayControl {
    async fn on_packet(&self, _packet: HeartBeat, ctx: &ReceiveContext) {
        match self.directory.get(ctx.session).await {
            Some(session) => self.manager.on_heartbeat(session).await,
            None => warn!("heartbeat over unknown session {:?} - ignoring", ctx.session),
        }
    }
}

#[async_trait]
impl PacketHandler<ShutdownMessage> for RelayControl {
    async fn on_packet(&self, _packet: ShutdownMessage, ctx: &ReceiveContext) {
        self.manager.on_shutdown_message(ctx.session).await;
    }
}
