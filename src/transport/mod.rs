//! The reliable ordered transport between two peers, layered on the routed packet
//!  dispatcher.
//!
//! A [P2PConnection] performs a three-way handshake and then moves payloads through a
//!  circular sliding window of [crate::packets::BUFFER_LENGTH] slots: every data frame
//!  occupies one slot until the peer acknowledges it, unacknowledged slots are resent
//!  after an idle timeout. Connections are indexed by peer in the
//!  [ConnectionRegistry], which also owns the dispatcher subscription - callbacks look
//!  connections up instead of capturing them, which keeps the reference graph acyclic.

mod connection;
mod registry;

pub use connection::P2PConnection;
pub use registry::{AppMessageHandler, ConnectionRegistry};

#[cfg(test)]
pub use registry::MockAppMessageHandler;
