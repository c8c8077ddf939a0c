//! # meshdb — a peer-to-peer, eventually-consistent tree database
//!
//! Every meshdb node holds a local replica of a hierarchical key-value
//! tree and exchanges updates with a mesh of peers. The design goal is
//! convergence: any two nodes that stay transitively connected and keep
//! exchanging messages arrive at the same replica, independent of the
//! order writes originated in.
//!
//! The crate is built around four pieces:
//!
//! - **Vector clocks** capture causality per path; conflicts between
//!   concurrent writes are settled by pluggable, path-scoped strategies
//!   with a deterministic mesh-wide tiebreak.
//! - **The replication engine** ingests local and remote writes,
//!   resolves them against the store, notifies subscribers, and forwards
//!   updates with loop suppression and de-duplication.
//! - **Anti-entropy** recovers from partitions and lost messages with a
//!   fast clock-sync exchange and a slower pull-based data
//!   reconciliation stream.
//! - **Adapters** for storage and transport keep the engine portable: an
//!   in-memory store ships by default, and the transport can be the
//!   bundled TCP framing or an in-process hub.
//!
//! ## Quick start
//!
//! ```ignore
//! use meshdb::{MeshConfig, MemoryStore, ReplicationEngine, TcpTransport};
//! use meshdb::types::NodeId;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node_id = NodeId::random();
//!     let transport = Arc::new(
//!         TcpTransport::bind(node_id.clone(), "0.0.0.0:7600".parse()?).await?,
//!     );
//!     transport.connect("tcp://peer.example:7600").await?;
//!
//!     let engine = ReplicationEngine::start(
//!         MeshConfig::new().node_id(node_id.as_str()),
//!         Arc::new(MemoryStore::new()),
//!         transport,
//!     )
//!     .await?;
//!
//!     engine.put("users/alice", json!({"name": "Alice"})).await?;
//!     let user = engine.get("users/alice").await?;
//!     println!("alice = {:?}", user);
//!
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Consistency model
//!
//! meshdb is eventually consistent. Writes commit locally without
//! coordination and flow outward; conflicting versions of a path are
//! resolved the same way on every node, so replicas converge once the
//! mesh quiesces. There are no cross-path transactions and no
//! linearizable reads.

pub mod anti_entropy;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod types;

// Public API exports
pub use clock::{ClockOrdering, Dominance, VectorClock, Winner};
pub use config::MeshConfig;
pub use engine::{
    AfterPutHook, BeforePutHook, EngineStats, IngressOutcome, Lifecycle, PutDecision, PutOutcome,
    ReplicationEngine,
};
pub use error::{MeshError, MeshResult};
pub use resolver::{ConflictResolver, CustomResolver, Strategy};
pub use store::{MemoryStore, Store};
pub use subscriptions::{ChangeEvent, SubscriptionId, SubscriptionInfo, SubscriptionRegistry};
pub use transport::{
    ChangeRecord, MemoryHub, MemoryTransport, PutMessage, TcpTransport, Transport, TransportEvent,
    WireMessage,
};
pub use types::{MessageId, NodeId, Path, VersionedValue};

// Re-export commonly used external types for convenience
pub use serde_json::{json, Value as JsonValue};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use meshdb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{ClockOrdering, Dominance, VectorClock};
    pub use crate::config::MeshConfig;
    pub use crate::engine::{PutOutcome, ReplicationEngine};
    pub use crate::error::{MeshError, MeshResult};
    pub use crate::resolver::Strategy;
    pub use crate::store::{MemoryStore, Store};
    pub use crate::subscriptions::ChangeEvent;
    pub use crate::transport::{MemoryHub, TcpTransport, Transport};
    pub use crate::types::{NodeId, Path, VersionedValue};
    pub use serde_json::{json, Value as JsonValue};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// Call once at application startup. The log level is controlled via the
/// `MESHDB_LOG` environment variable (`error`, `warn`, `info`, `debug`,
/// `trace`); the default is `info`.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("MESHDB_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
