use thiserror::Error;

use crate::node_id::NodeId;

/// Failures surfaced by [crate::transport::P2PConnection]. Data-path loss is deliberately
///  not represented here: `send` hands a payload to the retransmission machinery and has
///  no delivery indication beyond the window advancing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("handshake with {0:?} timed out")]
    HandshakeTimeout(NodeId),

    /// The circular send window has no free slot. The caller may retry once ACKs have
    ///  advanced the window; nothing was enqueued.
    #[error("send window towards {0:?} is full")]
    WindowFull(NodeId),

    #[error("no established connection to {0:?}")]
    NotConnected(NodeId),

    #[error("connection is shutting down")]
    Closed,
}

/// Failures of a one-shot request/response exchange on the packet dispatcher.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RequestError {
    #[error("timed out waiting for a matching response")]
    Timeout,

    #[error("the request was cancelled")]
    Cancelled,
}
