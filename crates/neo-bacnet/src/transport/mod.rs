//! Transport Port
//!
//! Sends opaque frames to a link address (or broadcast) and hands every
//! inbound frame to a registered handler. Delivery is unreliable and
//! unordered; duplicates are possible.

mod memory;
mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::TransportError;

/// Callback invoked once per inbound frame with the link-level source
pub type ReceiveHandler = Arc<dyn Fn(SocketAddr, Bytes) + Send + Sync + 'static>;

/// Link-level target of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    Unicast(SocketAddr),
    Broadcast,
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkTarget::Unicast(addr) => write!(f, "{}", addr),
            LinkTarget::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// A datagram link.
///
/// `send` must not block: it either queues the frame or fails.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, target: LinkTarget, frame: Bytes) -> Result<(), TransportError>;

    /// Replace the inbound frame handler
    fn register_receive_handler(&self, handler: ReceiveHandler);

    fn local_addr(&self) -> SocketAddr;

    /// Stop receiving; later sends fail with `Closed`
    fn close(&self);
}
