//! Reliable peer-to-peer group transport: a routed packet layer with a reliable,
//!  ordered-intent datagram protocol on top, plus the relay-side session liveness that
//!  keeps NAT-bound clients reachable.
//!
//! ## Design goals
//!
//! * Peers are addressed by opaque 128-bit node ids, never by network addresses - the
//!   substrate underneath (overlay network, relay sessions) owns connectivity.
//! * Routing is best-effort and multi-hop: frames carry a TTL and an origin-assigned
//!   sequence number, forwarders drop expired, duplicate and unroutable frames without
//!   telling anyone. Loss only becomes visible one layer up.
//! * Reliability is end-to-end: a connection between two peers moves payloads through a
//!   circular window of 256 slots, every slot is acknowledged individually, and
//!   unacknowledged slots are resent from retained payloads after an idle timeout.
//! * The window is fixed and small on purpose. This protocol carries group chat and
//!   coordination traffic, not bulk transfers - congestion control tuned to a specific
//!   link is a non-goal.
//! * Delivery order is *intent*, not a guarantee across the wire: slot numbers tag
//!   datagrams, the receiver acknowledges whatever arrives in whatever order.
//! * The relay never reassembles streams. It forwards frames and tracks one thing per
//!   attached session: whether heartbeats still arrive.
//!
//! ## Layering
//!
//! ```ascii
//! application payloads
//!         |
//! P2PConnection          handshake, sliding-window ACK, retransmission
//!         |
//! RouterPacketDispatcher typed packets, request/response, subscriptions
//!         |
//! Router                 TTL-bounded forwarding between node ids
//!         |
//! neighbor sessions      opaque byte channels (overlay network, TCP relay)
//! ```
//!
//! ## Frame header
//!
//! All numbers in network byte order (BE):
//! ```ascii
//! 0:  CRC-64 checksum for the rest of the frame, starting after the checksum: u64
//! 8:  origin node id: u128
//! 24: destination node id: u128
//! 40: TTL (u8), decremented at each hop, dropped at 0
//! 41: origin-assigned sequence number: u32
//! 45: packet kind (u16, two ASCII characters)
//! 47: body length: u32
//! 51: body (kind-specific encoding)
//! ```
//!
//! ## Datagram body (kind `td`)
//!
//! ```ascii
//! 0: flags (u8): SYN=1, ACK=2, CON=4, FIN=8
//! 1: window slot: u16, always in [0, 256)
//! 3: payload presence (u8): 0 or 1
//! 4: payload length (u32) + payload, present only on data frames
//! ```
//!
//! The handshake uses three flag combinations: `SYN|CON` (request), `SYN|ACK|CON`
//!  (response), `ACK|CON` (confirmation, informational). Handshake frames never carry a
//!  payload, and neither do pure ACKs.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod net;
pub mod node_id;
pub mod packets;
pub mod relay;
pub mod routing;
pub mod test_util;
pub mod transport;
