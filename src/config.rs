/// Configuration for a meshdb node.
///
/// All recognized options with their defaults. Construction-time
/// validation (strategy paths, overrides) is the only fatal error
/// surface in the crate; everything after startup degrades gracefully.
use crate::resolver::{CustomResolver, Strategy};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Configuration for the replication engine and its background tasks.
#[derive(Clone)]
pub struct MeshConfig {
    /// Explicit node id; a random one is generated when unset.
    pub node_id_override: Option<String>,
    /// Transport URLs of peers to connect to at startup.
    pub peers: Vec<String>,
    /// Strategy applied when no path-specific entry matches.
    pub default_strategy: Strategy,
    /// Path prefix -> strategy, matched longest-prefix.
    pub path_strategies: HashMap<String, Strategy>,
    /// Path prefix -> user resolver for `Strategy::Custom` paths.
    pub custom_resolvers: HashMap<String, CustomResolver>,
    /// Retention for processed message ids (default: 5 minutes).
    pub max_message_age: Duration,
    /// Committed versions retained per path (default: 10).
    pub max_versions: usize,
    /// Interval for data reconciliation; disabled when unset.
    pub anti_entropy_interval: Option<Duration>,
    /// Interval for vector-clock sync (default: 2 seconds).
    pub clock_sync_interval: Duration,
    /// Entries per anti-entropy response batch (default: 50).
    pub batch_size: usize,
    /// Pause between anti-entropy batches (default: 50 ms).
    pub batch_pause: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id_override: None,
            peers: Vec::new(),
            default_strategy: Strategy::VectorDominance,
            path_strategies: HashMap::new(),
            custom_resolvers: HashMap::new(),
            max_message_age: Duration::from_millis(300_000),
            max_versions: 10,
            anti_entropy_interval: None,
            clock_sync_interval: Duration::from_millis(2_000),
            batch_size: 50,
            batch_pause: Duration::from_millis(50),
        }
    }
}

impl MeshConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit node id.
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id_override = Some(id.into());
        self
    }

    /// Add a peer URL to connect to at startup.
    pub fn peer(mut self, url: impl Into<String>) -> Self {
        self.peers.push(url.into());
        self
    }

    /// Set the default conflict strategy.
    pub fn default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Assign a strategy to a path prefix.
    pub fn strategy_for(mut self, path: impl Into<String>, strategy: Strategy) -> Self {
        self.path_strategies.insert(path.into(), strategy);
        self
    }

    /// Register a custom resolver for a path prefix.
    ///
    /// The path should also be mapped to [`Strategy::Custom`] for the
    /// resolver to be consulted.
    pub fn custom_resolver(mut self, path: impl Into<String>, resolver: CustomResolver) -> Self {
        let path = path.into();
        self.path_strategies.insert(path.clone(), Strategy::Custom);
        self.custom_resolvers.insert(path, resolver);
        self
    }

    /// Set the processed-message retention window.
    pub fn max_message_age(mut self, age: Duration) -> Self {
        self.max_message_age = age;
        self
    }

    /// Set the per-path version history bound.
    pub fn max_versions(mut self, max: usize) -> Self {
        self.max_versions = max;
        self
    }

    /// Enable periodic data reconciliation at the given interval.
    pub fn anti_entropy_interval(mut self, interval: Duration) -> Self {
        self.anti_entropy_interval = Some(interval);
        self
    }

    /// Set the vector-clock sync interval.
    pub fn clock_sync_interval(mut self, interval: Duration) -> Self {
        self.clock_sync_interval = interval;
        self
    }

    /// Set the anti-entropy batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the pause between anti-entropy batches.
    pub fn batch_pause(mut self, pause: Duration) -> Self {
        self.batch_pause = pause;
        self
    }
}

impl fmt::Debug for MeshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshConfig")
            .field("node_id_override", &self.node_id_override)
            .field("peers", &self.peers)
            .field("default_strategy", &self.default_strategy)
            .field("path_strategies", &self.path_strategies)
            .field("custom_resolvers", &self.custom_resolvers.len())
            .field("max_message_age", &self.max_message_age)
            .field("max_versions", &self.max_versions)
            .field("anti_entropy_interval", &self.anti_entropy_interval)
            .field("clock_sync_interval", &self.clock_sync_interval)
            .field("batch_size", &self.batch_size)
            .field("batch_pause", &self.batch_pause)
            .finish()
    }
}
