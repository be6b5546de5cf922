use std::sync::{Arc, Weak};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TransportConfig;
use crate::dispatch::{PacketHandler, ReceiveContext, RouterPacketDispatcher};
use crate::error::ConnectionError;
use crate::node_id::{NodeId, SessionId};
use crate::packets::{DatagramFlags, P2pPacket, TransDatagram};
use crate::transport::connection::P2PConnection;

/// User-level sink for messages delivered by the transport. Messages arriving over a
///  reliable P2P connection carry [SessionId::P2P_SENTINEL] as their session.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppMessageHandler: Send + Sync + 'static {
    async fn on_message(&self, from: NodeId, session: SessionId, message: &[u8]);
}

/// Owns all reliable connections of this node, indexed by peer.
///
/// The registry subscribes to [TransDatagram] packets on the dispatcher; the
///  subscription holds the registry weakly and looks connections up per datagram, so
///  connections and dispatcher never reference each other directly.
pub struct ConnectionRegistry {
    dispatcher: Arc<RouterPacketDispatcher>,
    config: Arc<TransportConfig>,
    app_handler: Arc<dyn AppMessageHandler>,
    shutdown: CancellationToken,
    connections: RwLock<FxHashMap<NodeId, Arc<P2PConnection>>>,
}

impl ConnectionRegistry {
    pub async fn new(
        dispatcher: Arc<RouterPacketDispatcher>,
        config: Arc<TransportConfig>,
        app_handler: Arc<dyn AppMessageHandler>,
        shutdown: CancellationToken,
    ) -> Arc<ConnectionRegistry> {
        let registry = Arc::new(ConnectionRegistry {
            dispatcher: dispatcher.clone(),
            config,
            app_handler,
            shutdown,
            connections: Default::default(),
        });

        dispatcher
            .on_receive::<TransDatagram>(Arc::new(DatagramSubscriber {
                registry: Arc::downgrade(&registry),
            }))
            .await;
        dispatcher
            .on_receive::<P2pPacket>(Arc::new(DirectPacketSubscriber {
                registry: Arc::downgrade(&registry),
            }))
            .await;

        registry
    }

    /// The connection to `peer`, created (not yet connected) if there is none.
    pub async fn connection_to(&self, peer: NodeId) -> Arc<P2PConnection> {
        if let Some(connection) = self.connections.read().await.get(&peer) {
            return connection.clone();
        }

        let mut connections = self.connections.write().await;
        connections
            .entry(peer)
            .or_insert_with(|| {
                debug!("creating connection state for {:?}", peer);
                P2PConnection::new(
                    peer,
                    self.dispatcher.clone(),
                    self.app_handler.clone(),
                    self.config.clone(),
                    &self.shutdown,
                )
            })
            .clone()
    }

    pub async fn get(&self, peer: NodeId) -> Option<Arc<P2PConnection>> {
        self.connections.read().await.get(&peer).cloned()
    }

    /// Convenience: get-or-create plus handshake.
    pub async fn connect(&self, peer: NodeId) -> Result<Arc<P2PConnection>, ConnectionError> {
        let connection = self.connection_to(peer).await;
        connection.connect().await?;
        Ok(connection)
    }

    pub async fn disconnect(&self, peer: NodeId) {
        let removed = self.connections.write().await.remove(&peer);
        if let Some(connection) = removed {
            connection.disconnect().await;
        }
    }

    async fn on_datagram(&self, from: NodeId, datagram: TransDatagram) {
        // connections come into existence through a local connect() or through an
        //  inbound handshake request - any other datagram without one is stray traffic
        let connection = if datagram.flag == DatagramFlags::FIRST_HANDSHAKE {
            Some(self.connection_to(from).await)
        }
        else {
            self.get(from).await
        };

        match connection {
            Some(connection) => connection.on_datagram(datagram).await,
            None => debug!("datagram from unknown peer {:?} - dropping {:?}", from, datagram),
        }
    }
}

struct DatagramSubscriber {
    registry: Weak<ConnectionRegistry>,
}

#[async_trait]
impl PacketHandler<TransDatagram> for DatagramSubscriber {
    async fn on_packet(&self, packet: TransDatagram, ctx: &ReceiveContext) {
        if let Some(registry) = self.registry.upgrade() {
            registry.on_datagram(ctx.from, packet).await;
        }
    }
}

/// Direct fire-and-forget payloads bypass the reliable connection and go straight to
///  the application, under the session they actually arrived on.
struct DirectPacketSubscriber {
    registry: Weak<ConnectionRegistry>,
}

#[async_trait]
impl PacketHandler<P2pPacket> for DirectPacketSubscriber {
    async fn on_packet(&self, packet: P2pPacket, ctx: &ReceiveContext) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .app_handler
                .on_message(ctx.from, ctx.session, &packet.payload)
                .await;
        }
    }
}
