//! Network-layer session implementations.
//!
//! The transport core treats sessions as opaque byte channels; this module provides the
//!  TCP-backed implementation the relay and its clients use when no direct overlay path
//!  exists.

mod tcp_session;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::node_id::SessionId;

pub use tcp_session::TcpSession;

/// Hands out process-unique session handles for accepted connections.
pub struct SessionIdAllocator {
    next: AtomicU64,
}

impl SessionIdAllocator {
    pub fn new() -> SessionIdAllocator {
        SessionIdAllocator { next: AtomicU64::new(1) }
    }

    pub fn next(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIdAllocator {
    fn default() -> Self {
        SessionIdAllocator::new()
    }
}
