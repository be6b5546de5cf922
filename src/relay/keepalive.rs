use std::sync::Arc;

use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TransportConfig;
use crate::dispatch::RouterPacketDispatcher;
use crate::node_id::NodeId;
use crate::packets::HeartBeat;

/// Client-side half of the relay liveness protocol: periodically heartbeats towards the
///  relay so its watchdog keeps the session. Runs until the token fires.
pub fn spawn_keepalive(
    dispatcher: Arc<RouterPacketDispatcher>,
    relay: NodeId,
    config: Arc<TransportConfig>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("starting keepalive towards {:?}", relay);
        loop {
            select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(config.heartbeat_interval) => {
                    dispatcher.send(relay, &HeartBeat).await;
                }
            }
        }
        debug!("keepalive towards {:?} stopped", relay);
    })
}
