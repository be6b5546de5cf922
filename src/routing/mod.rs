mod router;

pub use router::{InboundFrameHandler, NeighborLink, Router};

#[cfg(test)]
pub use router::{MockInboundFrameHandler, MockNeighborLink};
