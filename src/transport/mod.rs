/// The message bus between replicas.
///
/// The engine sees the network as a directional bus: it can address a
/// connected peer by node id, broadcast a PUT to every connected peer,
/// and consumes a single serialized stream of incoming events. How bytes
/// move is entirely the adapter's business.
///
/// Two adapters ship with the crate:
///
/// - [`memory::MemoryHub`] wires engines together in-process, with
///   severable links for partition testing.
/// - [`tcp::TcpTransport`] speaks length-prefixed JSON frames over TCP
///   with an `identify` handshake.
use crate::clock::VectorClock;
use crate::error::MeshResult;
use crate::types::{MessageId, NodeId, Path};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use tokio::sync::mpsc;

pub mod memory;
pub mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::TcpTransport;

/// A replicated write in flight.
///
/// `visited_servers`, `forwarded`, and `anti_entropy` default when a
/// peer omits them; a message is never rejected for missing flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutMessage {
    /// Target path.
    pub path: Path,
    /// The value being written; `Null` is a tombstone.
    pub value: JsonValue,
    /// Wall-clock millis at the origin.
    pub timestamp: i64,
    /// The node that first issued this write.
    pub origin: NodeId,
    /// De-duplication tag, unique per PUT in flight.
    pub msg_id: MessageId,
    /// The origin's causal clock at the time of the write.
    pub clock: VectorClock,
    /// Nodes this message has already passed through.
    #[serde(default)]
    pub visited_servers: HashSet<NodeId>,
    /// True when relayed rather than sent by the origin.
    #[serde(default)]
    pub forwarded: bool,
    /// True when delivered by reconciliation; suppresses re-broadcast.
    #[serde(default)]
    pub anti_entropy: bool,
}

/// One entry of an anti-entropy response batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: Path,
    pub value: JsonValue,
    pub timestamp: i64,
    pub origin: NodeId,
    pub clock: VectorClock,
}

/// Protocol messages carried by the transport.
///
/// The wire form is an object tagged by `type`; field layouts are part
/// of the protocol and shared by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Handshake announcing a node on a fresh connection.
    Identify { node_id: NodeId, url: String },

    /// A replicated write.
    Put(PutMessage),

    /// Fast periodic clock exchange.
    VectorClockSync {
        clock: VectorClock,
        node_id: NodeId,
        sync_id: String,
        timestamp: i64,
    },

    /// Reply to a clock sync.
    VectorClockSyncResponse {
        clock: VectorClock,
        node_id: NodeId,
        in_response_to: String,
        timestamp: i64,
    },

    /// Pull request for missing data, carrying the requester's clock.
    AntiEntropyRequest {
        request_id: String,
        node_id: NodeId,
        clock: VectorClock,
        timestamp: i64,
    },

    /// One batch of a reconciliation stream.
    AntiEntropyResponse {
        response_id: String,
        node_id: NodeId,
        clock: VectorClock,
        batch_index: usize,
        total_batches: usize,
        changes: Vec<ChangeRecord>,
    },
}

/// Events delivered to the engine's single ingress stream.
///
/// Adapters must serialize concurrent deliveries into this stream; the
/// engine consumes it from one dispatch task.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message arrived from a peer.
    Message { from: NodeId, message: WireMessage },
    /// A peer connection was established.
    PeerConnected(NodeId),
    /// A peer connection was lost.
    PeerDisconnected(NodeId),
}

/// Contract for the transport adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to one connected peer.
    async fn send_to(&self, peer: &NodeId, message: WireMessage) -> MeshResult<()>;

    /// Send a PUT to every currently connected peer.
    ///
    /// Per-peer failures are the adapter's to log; anti-entropy recovers
    /// whatever broadcast loses.
    async fn broadcast_put(&self, message: PutMessage) -> MeshResult<()>;

    /// Node ids of currently connected peers.
    fn connected_peers(&self) -> Vec<NodeId>;

    /// Hand over the ingress event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Shut the transport down.
    async fn close(&self) -> MeshResult<()>;
}
