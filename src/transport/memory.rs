/// In-process transport for tests, demos, and embedded topologies.
///
/// A [`MemoryHub`] wires any number of engines together in one process.
/// Every registered node is connected to every other by default; links
/// can be severed and healed at runtime to simulate partitions. Delivery
/// is an unbounded channel per node, so each engine still consumes a
/// single serialized ingress stream.
use super::{PutMessage, Transport, TransportEvent, WireMessage};
use crate::error::{MeshError, MeshResult};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

struct HubInner {
    nodes: DashMap<NodeId, mpsc::UnboundedSender<TransportEvent>>,
    severed: Mutex<HashSet<(NodeId, NodeId)>>,
}

impl HubInner {
    fn link_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn link_up(&self, a: &NodeId, b: &NodeId) -> bool {
        !self
            .severed
            .lock()
            .expect("severed set poisoned")
            .contains(&Self::link_key(a, b))
    }

    fn deliver(&self, to: &NodeId, event: TransportEvent) -> bool {
        match self.nodes.get(to) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }
}

/// A fully connected in-process mesh with severable links.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                nodes: DashMap::new(),
                severed: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Register a node and return its transport.
    ///
    /// Connection events are exchanged with every node already present.
    pub fn register(&self, node_id: NodeId) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();

        for existing in self.inner.nodes.iter() {
            let _ = existing
                .value()
                .send(TransportEvent::PeerConnected(node_id.clone()));
            let _ = tx.send(TransportEvent::PeerConnected(existing.key().clone()));
        }

        self.inner.nodes.insert(node_id.clone(), tx);

        MemoryTransport {
            hub: Arc::clone(&self.inner),
            node_id,
            events: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Cut the link between two nodes (both directions).
    pub fn sever(&self, a: &NodeId, b: &NodeId) {
        self.inner
            .severed
            .lock()
            .expect("severed set poisoned")
            .insert(HubInner::link_key(a, b));
        self.inner
            .deliver(a, TransportEvent::PeerDisconnected(b.clone()));
        self.inner
            .deliver(b, TransportEvent::PeerDisconnected(a.clone()));
    }

    /// Restore a severed link.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.inner
            .severed
            .lock()
            .expect("severed set poisoned")
            .remove(&HubInner::link_key(a, b));
        self.inner
            .deliver(a, TransportEvent::PeerConnected(b.clone()));
        self.inner
            .deliver(b, TransportEvent::PeerConnected(a.clone()));
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<HubInner>,
    node_id: NodeId,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// The node id this endpoint was registered under.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, peer: &NodeId, message: WireMessage) -> MeshResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshError::Transport("transport is closed".to_string()));
        }
        if !self.hub.link_up(&self.node_id, peer) {
            return Err(MeshError::PeerUnreachable(peer.as_str().to_string()));
        }
        if !self.hub.deliver(
            peer,
            TransportEvent::Message {
                from: self.node_id.clone(),
                message,
            },
        ) {
            return Err(MeshError::PeerUnreachable(peer.as_str().to_string()));
        }
        Ok(())
    }

    async fn broadcast_put(&self, message: PutMessage) -> MeshResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MeshError::Transport("transport is closed".to_string()));
        }
        for peer in self.connected_peers() {
            let event = TransportEvent::Message {
                from: self.node_id.clone(),
                message: WireMessage::Put(message.clone()),
            };
            if !self.hub.deliver(&peer, event) {
                debug!(peer = %peer, "broadcast delivery failed");
            }
        }
        Ok(())
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        if self.closed.load(Ordering::Acquire) {
            return Vec::new();
        }
        self.hub
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|peer| peer != &self.node_id && self.hub.link_up(&self.node_id, peer))
            .collect()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().expect("events receiver poisoned").take()
    }

    async fn close(&self) -> MeshResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.hub.nodes.remove(&self.node_id);
        for peer in self.hub.nodes.iter() {
            let _ = peer
                .value()
                .send(TransportEvent::PeerDisconnected(self.node_id.clone()));
        }
        Ok(())
    }
}
