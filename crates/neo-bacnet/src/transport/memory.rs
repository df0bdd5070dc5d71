//! In-process transport
//!
//! [`MemoryNetwork`] is a simulated broadcast link. Every [`MemoryTransport`]
//! attached to it gets an address; frames are delivered on a spawned task so
//! the receiving side runs on its own execution context, like a real socket.
//! The network can drop or duplicate frames to exercise loss handling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::{LinkTarget, ReceiveHandler, Transport};
use crate::error::TransportError;

/// Shared link that memory transports attach to
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<SocketAddr, Weak<NodeState>>>,
    drop_next: AtomicUsize,
    duplicate: AtomicBool,
}

struct NodeState {
    addr: SocketAddr,
    handler: RwLock<Option<ReceiveHandler>>,
    sent: Mutex<Vec<(LinkTarget, Bytes)>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

impl NodeState {
    fn deliver(&self, from: SocketAddr, frame: Bytes) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler(from, frame);
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new node at `addr`
    pub fn attach(self: &Arc<Self>, addr: SocketAddr) -> MemoryTransport {
        let node = Arc::new(NodeState {
            addr,
            handler: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });
        self.nodes.write().insert(addr, Arc::downgrade(&node));
        MemoryTransport {
            node,
            network: Some(Arc::clone(self)),
        }
    }

    /// Silently drop the next `count` frames sent on the link
    pub fn drop_next(&self, count: usize) {
        self.drop_next.store(count, Ordering::SeqCst);
    }

    /// Deliver every frame twice
    pub fn set_duplicate(&self, duplicate: bool) {
        self.duplicate.store(duplicate, Ordering::SeqCst);
    }

    fn route(&self, from: SocketAddr, target: LinkTarget, frame: Bytes) {
        let dropped = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            tracing::trace!(%from, %target, "Dropping frame on memory link");
            return;
        }

        let receivers: Vec<Arc<NodeState>> = {
            let nodes = self.nodes.read();
            match target {
                LinkTarget::Unicast(addr) => nodes.get(&addr).and_then(Weak::upgrade).into_iter().collect(),
                LinkTarget::Broadcast => nodes
                    .iter()
                    .filter(|(addr, _)| **addr != from)
                    .filter_map(|(_, node)| node.upgrade())
                    .collect(),
            }
        };

        let copies = if self.duplicate.load(Ordering::SeqCst) { 2 } else { 1 };
        for node in receivers {
            for _ in 0..copies {
                let node = Arc::clone(&node);
                let frame = frame.clone();
                tokio::spawn(async move { node.deliver(from, frame) });
            }
        }
    }
}

/// Transport endpoint on a [`MemoryNetwork`], or a standalone recorder.
pub struct MemoryTransport {
    node: Arc<NodeState>,
    network: Option<Arc<MemoryNetwork>>,
}

impl MemoryTransport {
    /// Endpoint with no network: frames are only recorded, inbound frames
    /// are injected with [`MemoryTransport::inject`].
    pub fn standalone(addr: SocketAddr) -> Self {
        Self {
            node: Arc::new(NodeState {
                addr,
                handler: RwLock::new(None),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
            }),
            network: None,
        }
    }

    /// Deliver `frame` as if it arrived from `from`, on the calling thread
    pub fn inject(&self, from: SocketAddr, frame: Bytes) {
        self.node.deliver(from, frame);
    }

    /// Frames sent so far
    pub fn sent(&self) -> Vec<(LinkTarget, Bytes)> {
        self.node.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.node.sent.lock().len()
    }

    pub fn clear_sent(&self) {
        self.node.sent.lock().clear();
    }

    /// Make every subsequent send fail with an I/O error
    pub fn fail_sends(&self, fail: bool) {
        self.node.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, target: LinkTarget, frame: Bytes) -> Result<(), TransportError> {
        if self.node.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.node.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Io("simulated send failure".into()));
        }
        self.node.sent.lock().push((target, frame.clone()));
        if let Some(network) = &self.network {
            network.route(self.node.addr, target, frame);
        }
        Ok(())
    }

    fn register_receive_handler(&self, handler: ReceiveHandler) {
        *self.node.handler.write() = Some(handler);
    }

    fn local_addr(&self) -> SocketAddr {
        self.node.addr
    }

    fn close(&self) {
        self.node.closed.store(true, Ordering::SeqCst);
        *self.node.handler.write() = None;
        if let Some(network) = &self.network {
            network.nodes.write().remove(&self.node.addr);
        }
    }
}

impl Transport for Arc<MemoryTransport> {
    fn send(&self, target: LinkTarget, frame: Bytes) -> Result<(), TransportError> {
        self.as_ref().send(target, frame)
    }

    fn register_receive_handler(&self, handler: ReceiveHandler) {
        self.as_ref().register_receive_handler(handler)
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
    }

    fn close(&self) {
        self.as_ref().close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn collector(transport: &MemoryTransport) -> Arc<Mutex<Vec<(SocketAddr, Bytes)>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport.register_receive_handler(Arc::new(move |from: SocketAddr, frame: Bytes| {
            sink.lock().push((from, frame));
        }));
        received
    }

    #[tokio::test]
    async fn test_unicast_and_broadcast() {
        let network = MemoryNetwork::new();
        let a = network.attach(addr(1));
        let b = network.attach(addr(2));
        let c = network.attach(addr(3));
        let at_b = collector(&b);
        let at_c = collector(&c);

        a.send(LinkTarget::Unicast(addr(2)), Bytes::from_static(b"hi")).unwrap();
        a.send(LinkTarget::Broadcast, Bytes::from_static(b"all")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(at_b.lock().len(), 2);
        assert_eq!(at_c.lock().len(), 1);
        assert_eq!(at_c.lock()[0], (addr(1), Bytes::from_static(b"all")));
        assert_eq!(a.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_drop_and_duplicate() {
        let network = MemoryNetwork::new();
        let a = network.attach(addr(1));
        let b = network.attach(addr(2));
        let at_b = collector(&b);

        network.drop_next(1);
        a.send(LinkTarget::Unicast(addr(2)), Bytes::from_static(b"lost")).unwrap();
        network.set_duplicate(true);
        a.send(LinkTarget::Unicast(addr(2)), Bytes::from_static(b"twice")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let received = at_b.lock();
        assert_eq!(received.len(), 2);
        assert!(received.iter().all(|(_, f)| f == &Bytes::from_static(b"twice")));
    }

    #[test]
    fn test_closed_transport_rejects_sends() {
        let t = MemoryTransport::standalone(addr(9));
        t.close();
        assert_eq!(
            t.send(LinkTarget::Broadcast, Bytes::new()),
            Err(TransportError::Closed)
        );
    }
}
