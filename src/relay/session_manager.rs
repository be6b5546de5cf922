use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::select;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::node_id::SessionId;

/// A session as the relay sees it: something heartbeats and shutdown notices can be
///  sent on, and that can be closed. The network layer provides the implementation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelaySession: Send + Sync + 'static {
    fn id(&self) -> SessionId;

    async fn send_heartbeat(&self) -> anyhow::Result<()>;

    async fn send_shutdown(&self) -> anyhow::Result<()>;

    async fn close(&self);
}

/// Observer of session lifecycle on the relay. Fired on shutdown-message receipt,
///  heartbeat timeout, and explicit removal.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RelaySessionEvents: Send + Sync + 'static {
    async fn on_session_disconnected(&self, session: SessionId);
}

struct WatchdogEntry {
    session: Arc<dyn RelaySession>,
    last_heartbeat_at: Instant,
}

/// Keeps one liveness entry per attached session and deterministically shuts down the
///  stale ones.
///
/// A session is in the map exactly as long as the relay considers it live: it enters
///  through [RelaySessionManager::attach] and leaves through a shutdown message, a
///  heartbeat timeout, or explicit removal.
pub struct RelaySessionManager {
    config: Arc<TransportConfig>,
    events: Arc<dyn RelaySessionEvents>,
    shutdown: CancellationToken,
    control_plane: RwLock<Option<SessionId>>,
    sessions: RwLock<FxHashMap<SessionId, WatchdogEntry>>,

    /// Unattached sessions that already got their one shutdown notice. Further
    ///  heartbeats from them are ignored, which is the moral equivalent of removing a
    ///  per-session heartbeat handler.
    rejected: Mutex<FxHashSet<SessionId>>,
}

impl RelaySessionManager {
    pub fn new(
        config: Arc<TransportConfig>,
        events: Arc<dyn RelaySessionEvents>,
        shutdown: CancellationToken,
    ) -> Arc<RelaySessionManager> {
        Arc::new(RelaySessionManager {
            config,
            events,
            shutdown,
            control_plane: Default::default(),
            sessions: Default::default(),
            rejected: Mutex::new(FxHashSet::default()),
        })
    }

    /// The coordinator link also heartbeats, but is not a relayed client session and
    ///  must never be evicted. Matching is by session identity, not node id.
    pub async fn set_control_plane(&self, session: SessionId) {
        *self.control_plane.write().await = Some(session);
    }

    /// Idempotent: returns `Some(id)` when the session was stored and `None` when this
    ///  id is already attached.
    pub async fn attach(&self, id: SessionId, session: Arc<dyn RelaySession>) -> Option<SessionId> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            debug!("session {:?} is already attached", id);
            return None;
        }

        self.rejected.lock().await.remove(&id);
        sessions.insert(id, WatchdogEntry {
            session,
            last_heartbeat_at: Instant::now(),
        });
        info!("attached session {:?}", id);
        Some(id)
    }

    pub async fn is_attached(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    pub async fn num_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// A heartbeat arrived on `session`. Attached sessions get their liveness refreshed
    ///  and an echo; unattached sessions get exactly one shutdown notice and are never
    ///  attached from here.
    pub async fn on_heartbeat(&self, session: Arc<dyn RelaySession>) {
        let id = session.id();

        if *self.control_plane.read().await == Some(id) {
            trace!("heartbeat from the control-plane session - ignoring");
            return;
        }

        let attached = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(&id) {
                Some(entry) => {
                    entry.last_heartbeat_at = Instant::now();
                    true
                }
                None => false,
            }
        };

        if attached {
            trace!("heartbeat from {:?}", id);
            if let Err(e) = session.send_heartbeat().await {
                debug!("heartbeat echo to {:?} failed: {}", id, e);
            }
        }
        else if self.rejected.lock().await.insert(id) {
            warn!("heartbeat from unattached session {:?} - sending shutdown", id);
            if let Err(e) = session.send_shutdown().await {
                debug!("shutdown notice to {:?} failed: {}", id, e);
            }
        }
        else {
            trace!("further heartbeat from rejected session {:?} - ignoring", id);
        }
    }

    /// The peer announced it is going away: drop the entry and tell the observers.
    pub async fn on_shutdown_message(&self, id: SessionId) {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_some() {
            info!("session {:?} announced shutdown", id);
            self.events.on_session_disconnected(id).await;
        }
        else {
            debug!("shutdown message from session {:?} that is not attached", id);
        }
    }

    /// Explicit removal, e.g. because the business layer kicked the client.
    pub async fn detach(&self, id: SessionId) {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_some() {
            info!("detached session {:?}", id);
            self.events.on_session_disconnected(id).await;
        }
    }

    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            info!("starting relay session watchdog");
            loop {
                select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = sleep(manager.config.watchdog_interval) => {
                        manager.evict_stale_sessions().await
                    }
                }
            }
            debug!("relay session watchdog stopped");
        })
    }

    async fn evict_stale_sessions(&self) {
        let stale = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, entry)| entry.last_heartbeat_at.elapsed() > self.config.session_timeout)
                .map(|(id, entry)| (*id, entry.session.clone()))
                .collect::<Vec<_>>()
        };

        for (id, session) in stale {
            warn!("session {:?} exceeded the heartbeat timeout - shutting it down", id);
            self.events.on_session_disconnected(id).await;
            if let Err(e) = session.send_shutdown().await {
                debug!("shutdown notice to {:?} failed: {}", id, e);
            }
            session.close().await;
            self.sessions.write().await.remove(&id);
        }
    }
}
