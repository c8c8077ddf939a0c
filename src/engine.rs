/// The replication engine.
///
/// One engine instance runs per node. It ingests local writes and
/// remote PUT messages, consults the conflict resolver, advances its
/// causal clock, commits through the store adapter, notifies
/// subscribers, and forwards updates across the mesh with loop
/// suppression and message de-duplication.
///
/// # Concurrency
///
/// All mutable replica state (clock, known ids, processed set, version
/// history, lifecycle) lives behind a single async mutex; every engine
/// operation is a short critical section under it, and the incoming
/// message stream is consumed by one dispatch task. Store and transport
/// I/O never interleave replica-state mutation from two operations.
///
/// # Lifecycle
///
/// `Starting → Running → Draining → Closed`. [`prepare_shutdown`]
/// stops the periodic tasks, rejects new subscriptions, and ignores
/// incoming PUTs; [`close`] flushes and releases the adapters.
///
/// [`prepare_shutdown`]: ReplicationEngine::prepare_shutdown
/// [`close`]: ReplicationEngine::close
use crate::anti_entropy;
use crate::clock::VectorClock;
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::resolver::ConflictResolver;
use crate::store::Store;
use crate::subscriptions::{ChangeEvent, SubscriptionId, SubscriptionRegistry};
use crate::transport::{PutMessage, Transport, TransportEvent, WireMessage};
use crate::types::{now_ms, MessageId, NodeId, Path, VersionedValue};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Adapters are being attached.
    Starting,
    /// Normal operation.
    Running,
    /// Shutting down: mutations are quietly refused.
    Draining,
    /// Adapters released.
    Closed,
}

/// Result of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The write was committed (and propagated when peers are up).
    Committed,
    /// A before-put hook vetoed the write.
    Rejected,
    /// The engine is draining; nothing happened.
    Draining,
}

/// Result of processing one remote PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// The message was resolved and committed.
    Applied,
    /// The message id was seen before; no effect.
    Duplicate,
    /// This node is in the message's visited set; no effect.
    LoopSuppressed,
    /// The engine is draining; no effect.
    Draining,
}

/// Verdict of a before-put hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutDecision {
    /// Let the write continue.
    Proceed,
    /// Veto the write.
    Reject,
}

/// Hook consulted before a local write commits.
pub type BeforePutHook = Arc<dyn Fn(&Path, &JsonValue) -> PutDecision + Send + Sync>;

/// Hook invoked after a local write commits: `(path, new, old)`.
pub type AfterPutHook = Arc<dyn Fn(&Path, &JsonValue, Option<&JsonValue>) + Send + Sync>;

/// Deepest value nesting accepted by `put`.
///
/// Matches the JSON codec's recursion limit, so every committed value
/// is guaranteed encodable on the wire.
const MAX_VALUE_DEPTH: usize = 128;

fn value_within_depth(value: &JsonValue, budget: usize) -> bool {
    if budget == 0 {
        return false;
    }
    match value {
        JsonValue::Array(items) => items.iter().all(|v| value_within_depth(v, budget - 1)),
        JsonValue::Object(map) => map.values().all(|v| value_within_depth(v, budget - 1)),
        _ => true,
    }
}

/// Message counters, observable through [`ReplicationEngine::stats`].
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) applied: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) loops_suppressed: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) forwarded: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Messages resolved and committed (local and remote).
    pub applied: u64,
    /// Messages dropped by de-duplication.
    pub duplicates: u64,
    /// Messages dropped by loop suppression.
    pub loops_suppressed: u64,
    /// Messages dropped for any other reason (draining, store failure).
    pub dropped: u64,
    /// Messages re-broadcast to peers.
    pub forwarded: u64,
    /// Node ids ever observed.
    pub known_nodes: usize,
    /// Active subscriptions.
    pub active_subscriptions: usize,
}

/// Mutable replica state, guarded by the engine's single lock.
pub(crate) struct ReplicaState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) clock: VectorClock,
    pub(crate) known_ids: HashSet<NodeId>,
    /// Message id -> arrival instant, pruned by age.
    pub(crate) processed: HashMap<MessageId, Instant>,
    /// Last committed versions per path, oldest first, bounded.
    pub(crate) version_history: HashMap<Path, VecDeque<VersionedValue>>,
}

pub(crate) struct EngineInner {
    pub(crate) node_id: NodeId,
    pub(crate) config: MeshConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: ConflictResolver,
    pub(crate) subscriptions: Arc<SubscriptionRegistry>,
    pub(crate) state: Mutex<ReplicaState>,
    pub(crate) stats: StatCounters,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    before_put: RwLock<Vec<BeforePutHook>>,
    after_put: RwLock<Vec<AfterPutHook>>,
}

/// Handle to a running engine. Clones share the same instance.
#[derive(Clone)]
pub struct ReplicationEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl ReplicationEngine {
    /// Start an engine over the given adapters.
    ///
    /// Takes over the transport's event stream, spawns the dispatch
    /// task and the anti-entropy tasks, and transitions to `Running`.
    pub async fn start(
        config: MeshConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
    ) -> MeshResult<Self> {
        let node_id = match &config.node_id_override {
            Some(id) => NodeId::new(id.clone()),
            None => NodeId::random(),
        };

        let resolver = ConflictResolver::new(
            config.default_strategy,
            config.path_strategies.clone(),
            config.custom_resolvers.clone(),
        )?;

        let events = transport.take_events().ok_or_else(|| {
            MeshError::Config("transport event stream already taken".to_string())
        })?;

        let mut clock = VectorClock::new();
        clock.increment(&node_id);
        let mut known_ids = HashSet::new();
        known_ids.insert(node_id.clone());

        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(EngineInner {
            node_id: node_id.clone(),
            config,
            store,
            transport,
            resolver,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            state: Mutex::new(ReplicaState {
                lifecycle: Lifecycle::Starting,
                clock,
                known_ids,
                processed: HashMap::new(),
                version_history: HashMap::new(),
            }),
            stats: StatCounters::default(),
            shutdown_tx,
            before_put: RwLock::new(Vec::new()),
            after_put: RwLock::new(Vec::new()),
        });

        let engine = Self { inner };
        engine.spawn_dispatch(events);
        anti_entropy::spawn(engine.clone());

        engine.inner.state.lock().await.lifecycle = Lifecycle::Running;
        info!(node = %node_id, "replication engine running");
        Ok(engine)
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Snapshot of the engine's causal clock.
    pub async fn clock(&self) -> VectorClock {
        self.inner.state.lock().await.clock.clone()
    }

    /// Every node id this engine has observed.
    pub async fn known_ids(&self) -> HashSet<NodeId> {
        self.inner.state.lock().await.known_ids.clone()
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().await.lifecycle
    }

    /// Point-in-time statistics.
    pub async fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock().await;
        EngineStats {
            applied: self.inner.stats.applied.load(Ordering::Relaxed),
            duplicates: self.inner.stats.duplicates.load(Ordering::Relaxed),
            loops_suppressed: self.inner.stats.loops_suppressed.load(Ordering::Relaxed),
            dropped: self.inner.stats.dropped.load(Ordering::Relaxed),
            forwarded: self.inner.stats.forwarded.load(Ordering::Relaxed),
            known_nodes: state.known_ids.len(),
            active_subscriptions: self.inner.subscriptions.count(),
        }
    }

    /// Previously committed versions of a path, oldest first.
    pub async fn version_history(&self, path: &str) -> MeshResult<Vec<VersionedValue>> {
        let path = Path::parse(path)?;
        let state = self.inner.state.lock().await;
        Ok(state
            .version_history
            .get(&path)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Register a hook consulted before every local write.
    pub fn add_before_put(&self, hook: BeforePutHook) {
        self.inner
            .before_put
            .write()
            .expect("hook list poisoned")
            .push(hook);
    }

    /// Register a hook invoked after every local commit.
    pub fn add_after_put(&self, hook: AfterPutHook) {
        self.inner
            .after_put
            .write()
            .expect("hook list poisoned")
            .push(hook);
    }

    /// Write a value at a path.
    ///
    /// The write is validated, stamped with a fresh message id and this
    /// node's advanced clock, committed locally, and broadcast to every
    /// connected peer.
    pub async fn put(&self, path: &str, value: JsonValue) -> MeshResult<PutOutcome> {
        let path = Path::parse(path)?;
        if !value_within_depth(&value, MAX_VALUE_DEPTH) {
            return Err(MeshError::InvalidValue {
                reason: format!("value nesting exceeds {} levels", MAX_VALUE_DEPTH),
            });
        }

        {
            let hooks = self.inner.before_put.read().expect("hook list poisoned");
            for hook in hooks.iter() {
                if hook(&path, &value) == PutDecision::Reject {
                    debug!(path = %path, "write vetoed by before-put hook");
                    return Ok(PutOutcome::Rejected);
                }
            }
        }

        let (message, previous, committed) = {
            let mut state = self.inner.state.lock().await;
            if state.lifecycle != Lifecycle::Running {
                return Ok(PutOutcome::Draining);
            }

            state.clock.increment(&self.inner.node_id);
            let message = PutMessage {
                path: path.clone(),
                value,
                timestamp: now_ms(),
                origin: self.inner.node_id.clone(),
                msg_id: MessageId::random(),
                clock: state.clock.clone(),
                visited_servers: HashSet::new(),
                forwarded: false,
                anti_entropy: false,
            };

            state.processed.insert(message.msg_id.clone(), Instant::now());
            Self::prune_processed(&mut state, &self.inner.config);

            match self.commit_locked(&mut state, &message).await {
                Ok((committed, previous)) => (message, previous, committed),
                Err(e) => {
                    state.processed.remove(&message.msg_id);
                    return Err(e);
                }
            }
        };

        {
            let hooks = self.inner.after_put.read().expect("hook list poisoned");
            for hook in hooks.iter() {
                hook(&path, &committed.value, previous.as_ref().map(|p| &p.value));
            }
        }

        if let Err(e) = self.inner.transport.broadcast_put(message).await {
            // The write stays local; anti-entropy carries it later.
            warn!(path = %path, error = %e, "broadcast failed");
        }

        Ok(PutOutcome::Committed)
    }

    /// Read the value at a path.
    ///
    /// Missing paths and tombstones both read as `None`; metadata is
    /// never exposed through this call.
    pub async fn get(&self, path: &str) -> MeshResult<Option<JsonValue>> {
        let path = Path::parse(path)?;
        Ok(self
            .inner
            .store
            .get(&path)
            .await?
            .filter(|vv| !vv.is_tombstone())
            .map(|vv| vv.value))
    }

    /// Delete the value at a path by committing a tombstone.
    pub async fn delete(&self, path: &str) -> MeshResult<PutOutcome> {
        self.put(path, JsonValue::Null).await
    }

    /// Subscribe to changes at a path, its descendants, and ancestors.
    ///
    /// Refused while the engine is draining.
    pub async fn subscribe(
        &self,
        path: &str,
    ) -> MeshResult<(SubscriptionId, broadcast::Receiver<ChangeEvent>)> {
        let path = Path::parse(path)?;
        let state = self.inner.state.lock().await;
        if state.lifecycle != Lifecycle::Running {
            return Err(MeshError::Draining);
        }
        Ok(self.inner.subscriptions.subscribe(path))
    }

    /// Remove a subscription by id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.unsubscribe(id)
    }

    /// Process one remote PUT message.
    ///
    /// Implements de-duplication, loop suppression, conflict
    /// resolution, clock advancement, commit, notification, and
    /// re-broadcast. Anti-entropy deliveries are committed but never
    /// re-broadcast.
    pub async fn handle_incoming(&self, message: PutMessage) -> MeshResult<IngressOutcome> {
        let current_clock = {
            let mut state = self.inner.state.lock().await;

            if state.lifecycle != Lifecycle::Running {
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(IngressOutcome::Draining);
            }
            if state.processed.contains_key(&message.msg_id) {
                self.inner.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(IngressOutcome::Duplicate);
            }
            if message.visited_servers.contains(&self.inner.node_id) {
                self.inner
                    .stats
                    .loops_suppressed
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(IngressOutcome::LoopSuppressed);
            }

            state.processed.insert(message.msg_id.clone(), Instant::now());
            Self::prune_processed(&mut state, &self.inner.config);

            state.known_ids.insert(message.origin.clone());
            for id in message.clock.node_ids() {
                state.known_ids.insert(id.clone());
            }

            if let Err(e) = self.commit_locked(&mut state, &message).await {
                // Only a store-recorded message counts as processed.
                state.processed.remove(&message.msg_id);
                self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(path = %message.path, error = %e, "failed to commit remote update");
                return Err(e);
            }

            state.clock.clone()
        };

        if message.anti_entropy {
            return Ok(IngressOutcome::Applied);
        }

        let mut relay = message;
        relay.clock = current_clock;
        relay.visited_servers.insert(self.inner.node_id.clone());
        relay.forwarded = true;
        self.inner.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.inner.transport.broadcast_put(relay).await {
            warn!(error = %e, "re-broadcast failed");
        }

        Ok(IngressOutcome::Applied)
    }

    /// Enter the draining state: periodic tasks stop, new subscriptions
    /// are refused, and incoming PUTs are ignored.
    pub async fn prepare_shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if matches!(state.lifecycle, Lifecycle::Running | Lifecycle::Starting) {
                state.lifecycle = Lifecycle::Draining;
            }
        }
        let _ = self.inner.shutdown_tx.send(());
        info!(node = %self.inner.node_id, "engine draining");
    }

    /// Flush and release the store and transport.
    pub async fn close(&self) -> MeshResult<()> {
        self.prepare_shutdown().await;

        self.inner.store.flush().await?;
        self.inner.store.close().await?;
        self.inner.transport.close().await?;

        self.inner.state.lock().await.lifecycle = Lifecycle::Closed;
        info!(node = %self.inner.node_id, "engine closed");
        Ok(())
    }

    /// Shared commit path for local writes and remote ingress.
    ///
    /// Resolves against the existing version (a fresh path skips
    /// resolution), merges the engine clock, stamps the committed entry
    /// with the full summary, writes through the store, and notifies
    /// subscribers. Local writes differ from ingress only by carrying
    /// `origin == self` and an empty visited set.
    ///
    /// Re-deliveries through anti-entropy resolve to the state already
    /// held; those commits are quiet (no history entry, no
    /// notification) so a reconciliation cycle at quiescence has no
    /// observable effect.
    async fn commit_locked(
        &self,
        state: &mut ReplicaState,
        message: &PutMessage,
    ) -> MeshResult<(VersionedValue, Option<VersionedValue>)> {
        let incoming = VersionedValue::new(
            message.value.clone(),
            message.origin.clone(),
            message.clock.clone(),
            message.timestamp,
        );

        let existing = self.inner.store.get(&message.path).await?;
        let resolved = match &existing {
            None => incoming,
            Some(existing) => self
                .inner
                .resolver
                .resolve(&message.path, existing, &incoming),
        };

        state.clock.merge(&message.clock);
        for id in &state.known_ids {
            state.clock.ensure(id);
        }

        let mut committed = resolved;
        committed.clock = state.clock.clone();

        let value_changed = match &existing {
            None => true,
            Some(existing) => existing.value != committed.value,
        };
        let entry_changed = value_changed
            || match &existing {
                None => true,
                Some(existing) => *existing != committed,
            };
        let observable = value_changed || !message.anti_entropy;

        if entry_changed {
            self.inner.store.put(&message.path, committed.clone()).await?;
        }

        if observable {
            if let Some(existing) = &existing {
                Self::push_history(
                    state,
                    &message.path,
                    existing.clone(),
                    self.inner.config.max_versions,
                );
            }
            self.inner.subscriptions.notify(&ChangeEvent {
                path: message.path.clone(),
                value: committed.value.clone(),
                origin: committed.origin.clone(),
                timestamp: committed.timestamp,
            });
            self.inner.stats.applied.fetch_add(1, Ordering::Relaxed);
        }

        Ok((committed, existing))
    }

    fn push_history(
        state: &mut ReplicaState,
        path: &Path,
        version: VersionedValue,
        max_versions: usize,
    ) {
        let history = state.version_history.entry(path.clone()).or_default();
        history.push_back(version);
        while history.len() > max_versions {
            history.pop_front();
        }
    }

    fn prune_processed(state: &mut ReplicaState, config: &MeshConfig) {
        let max_age = config.max_message_age;
        state
            .processed
            .retain(|_, arrived| arrived.elapsed() < max_age);
    }

    /// Consume the transport's event stream until shutdown.
    fn spawn_dispatch(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let engine = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        engine.dispatch(event).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!(node = %engine.inner.node_id, "dispatch loop stopped");
        });
    }

    async fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message { from, message } => {
                self.dispatch_message(from, message).await
            }
            TransportEvent::PeerConnected(id) => {
                let mut state = self.inner.state.lock().await;
                state.known_ids.insert(id);
            }
            TransportEvent::PeerDisconnected(id) => {
                // In-flight messages from this peer are lost; anti-entropy
                // recovers them.
                debug!(peer = %id, "peer disconnected");
            }
        }
    }

    async fn dispatch_message(&self, from: NodeId, message: WireMessage) {
        match message {
            WireMessage::Put(put) => {
                if let Err(e) = self.handle_incoming(put).await {
                    warn!(peer = %from, error = %e, "failed to process remote put");
                }
            }

            WireMessage::VectorClockSync {
                clock,
                node_id,
                sync_id,
                ..
            } => {
                let reply_clock = {
                    let mut state = self.inner.state.lock().await;
                    if state.lifecycle != Lifecycle::Running {
                        return;
                    }
                    state.known_ids.insert(node_id.clone());
                    for id in clock.node_ids() {
                        state.known_ids.insert(id.clone());
                    }
                    state.clock.merge(&clock);
                    let known_ids: Vec<_> = state.known_ids.iter().cloned().collect();
                    for id in &known_ids {
                        state.clock.ensure(id);
                    }
                    state.clock.clone()
                };

                let response = WireMessage::VectorClockSyncResponse {
                    clock: reply_clock,
                    node_id: self.inner.node_id.clone(),
                    in_response_to: sync_id,
                    timestamp: now_ms(),
                };
                if let Err(e) = self.inner.transport.send_to(&node_id, response).await {
                    debug!(peer = %node_id, error = %e, "clock sync response failed");
                }
            }

            WireMessage::VectorClockSyncResponse { clock, node_id, .. } => {
                let mut state = self.inner.state.lock().await;
                if state.lifecycle != Lifecycle::Running {
                    return;
                }
                state.known_ids.insert(node_id);
                for id in clock.node_ids() {
                    state.known_ids.insert(id.clone());
                }
                state.clock.merge(&clock);
                let known_ids: Vec<_> = state.known_ids.iter().cloned().collect();
                for id in &known_ids {
                    state.clock.ensure(id);
                }
            }

            WireMessage::AntiEntropyRequest {
                request_id,
                node_id,
                clock,
                ..
            } => {
                anti_entropy::spawn_responder(self.clone(), node_id, request_id, clock);
            }

            WireMessage::AntiEntropyResponse {
                node_id, changes, ..
            } => {
                debug!(peer = %node_id, entries = changes.len(), "applying reconciliation batch");
                for change in changes {
                    let message = PutMessage {
                        path: change.path,
                        value: change.value,
                        timestamp: change.timestamp,
                        origin: change.origin,
                        msg_id: MessageId::random(),
                        clock: change.clock,
                        visited_servers: HashSet::new(),
                        forwarded: true,
                        anti_entropy: true,
                    };
                    if let Err(e) = self.handle_incoming(message).await {
                        warn!(peer = %node_id, error = %e, "failed to apply reconciliation entry");
                    }
                }
            }

            WireMessage::Identify { node_id, .. } => {
                let mut state = self.inner.state.lock().await;
                state.known_ids.insert(node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MemoryHub;
    use serde_json::json;
    use std::time::Duration;

    async fn solo_engine(name: &str) -> ReplicationEngine {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.register(NodeId::new(name)));
        ReplicationEngine::start(
            MeshConfig::new().node_id(name),
            Arc::new(MemoryStore::new()),
            transport,
        )
        .await
        .unwrap()
    }

    fn remote_put(path: &str, value: JsonValue, origin: &str, counter: u64) -> PutMessage {
        let origin = NodeId::new(origin);
        let mut clock = VectorClock::new();
        for _ in 0..counter {
            clock.increment(&origin);
        }
        PutMessage {
            path: Path::parse(path).unwrap(),
            value,
            timestamp: now_ms(),
            origin,
            msg_id: MessageId::random(),
            clock,
            visited_servers: HashSet::new(),
            forwarded: false,
            anti_entropy: false,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let engine = solo_engine("node-a").await;

        let outcome = engine.put("users/alice", json!({"name": "Alice"})).await.unwrap();
        assert_eq!(outcome, PutOutcome::Committed);

        let value = engine.get("users/alice").await.unwrap();
        assert_eq!(value, Some(json!({"name": "Alice"})));
        assert_eq!(engine.get("users/bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_rejects_bad_path() {
        let engine = solo_engine("node-a").await;
        assert!(engine.put("", json!(1)).await.is_err());
        assert!(engine.put("a//b", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_put_rejects_excessive_nesting() {
        let engine = solo_engine("node-a").await;

        let deep = (0..200).fold(json!(1), |acc, _| json!([acc]));
        assert!(matches!(
            engine.put("deep", deep).await,
            Err(MeshError::InvalidValue { .. })
        ));
        assert_eq!(engine.get("deep").await.unwrap(), None);

        // Shallow nesting is untouched.
        let fine = (0..20).fold(json!(1), |acc, _| json!([acc]));
        assert_eq!(engine.put("fine", fine).await.unwrap(), PutOutcome::Committed);
    }

    #[tokio::test]
    async fn test_delete_reads_as_none() {
        let engine = solo_engine("node-a").await;

        engine.put("x", json!(1)).await.unwrap();
        engine.delete("x").await.unwrap();

        assert_eq!(engine.get("x").await.unwrap(), None);
        // The tombstone is still a stored value.
        let stored = engine
            .inner
            .store
            .get(&Path::parse("x").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_tombstone());
    }

    #[tokio::test]
    async fn test_local_clock_monotonic() {
        let engine = solo_engine("node-a").await;
        let id = NodeId::new("node-a");

        let c0 = engine.clock().await;
        assert_eq!(c0.get(&id), 1); // incremented at engine start

        engine.put("x", json!(1)).await.unwrap();
        let c1 = engine.clock().await;
        engine.put("x", json!(2)).await.unwrap();
        let c2 = engine.clock().await;

        assert_eq!(c1.get(&id), 2);
        assert_eq!(c2.get(&id), 3);
        assert!(matches!(
            c2.compare(&c1),
            crate::clock::ClockOrdering::After
        ));
    }

    #[tokio::test]
    async fn test_duplicate_message_has_no_effect() {
        let engine = solo_engine("node-a").await;

        let msg = remote_put("x", json!(1), "node-b", 1);
        assert_eq!(
            engine.handle_incoming(msg.clone()).await.unwrap(),
            IngressOutcome::Applied
        );
        let clock_after_first = engine.clock().await;

        let mut replay = msg;
        replay.value = json!(999);
        assert_eq!(
            engine.handle_incoming(replay).await.unwrap(),
            IngressOutcome::Duplicate
        );

        assert_eq!(engine.get("x").await.unwrap(), Some(json!(1)));
        assert_eq!(engine.clock().await, clock_after_first);
        assert_eq!(engine.stats().await.duplicates, 1);
    }

    #[tokio::test]
    async fn test_visited_message_suppressed() {
        let engine = solo_engine("node-a").await;

        let mut msg = remote_put("x", json!(1), "node-b", 1);
        msg.visited_servers.insert(NodeId::new("node-a"));

        assert_eq!(
            engine.handle_incoming(msg).await.unwrap(),
            IngressOutcome::LoopSuppressed
        );
        assert_eq!(engine.get("x").await.unwrap(), None);
        assert_eq!(engine.stats().await.loops_suppressed, 1);
    }

    #[tokio::test]
    async fn test_remote_update_merges_clock_and_known_ids() {
        let engine = solo_engine("node-a").await;

        engine
            .handle_incoming(remote_put("x", json!(1), "node-b", 3))
            .await
            .unwrap();

        let clock = engine.clock().await;
        assert_eq!(clock.get(&NodeId::new("node-b")), 3);
        assert!(engine.known_ids().await.contains(&NodeId::new("node-b")));
    }

    #[tokio::test]
    async fn test_fresh_path_skips_resolution_committed_clock_is_summary() {
        let engine = solo_engine("node-a").await;

        engine
            .handle_incoming(remote_put("x", json!(1), "node-b", 1))
            .await
            .unwrap();

        let stored = engine
            .inner
            .store
            .get(&Path::parse("x").unwrap())
            .await
            .unwrap()
            .unwrap();
        // The committed entry carries the engine's full summary.
        assert_eq!(stored.clock.get(&NodeId::new("node-a")), 1);
        assert_eq!(stored.clock.get(&NodeId::new("node-b")), 1);
    }

    #[tokio::test]
    async fn test_version_history_bounded() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.register(NodeId::new("node-a")));
        let engine = ReplicationEngine::start(
            MeshConfig::new().node_id("node-a").max_versions(3),
            Arc::new(MemoryStore::new()),
            transport,
        )
        .await
        .unwrap();

        for i in 0..10 {
            engine.put("x", json!(i)).await.unwrap();
        }

        let history = engine.version_history("x").await.unwrap();
        assert_eq!(history.len(), 3);
        // Oldest dropped: the survivors are the three most recent
        // displaced versions.
        assert_eq!(history[0].value, json!(6));
        assert_eq!(history[2].value, json!(8));
    }

    #[tokio::test]
    async fn test_subscriber_notified_on_commit() {
        let engine = solo_engine("node-a").await;
        let (_id, mut rx) = engine.subscribe("users").await.unwrap();

        engine.put("users/alice", json!({"name": "A"})).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, Path::parse("users/alice").unwrap());
        assert_eq!(event.value, json!({"name": "A"}));
    }

    #[tokio::test]
    async fn test_before_put_hook_vetoes() {
        let engine = solo_engine("node-a").await;
        engine.add_before_put(Arc::new(|path, _value| {
            if path.as_str().starts_with("readonly") {
                PutDecision::Reject
            } else {
                PutDecision::Proceed
            }
        }));

        assert_eq!(
            engine.put("readonly/x", json!(1)).await.unwrap(),
            PutOutcome::Rejected
        );
        assert_eq!(engine.get("readonly/x").await.unwrap(), None);

        assert_eq!(
            engine.put("writable/x", json!(1)).await.unwrap(),
            PutOutcome::Committed
        );
    }

    #[tokio::test]
    async fn test_after_put_hook_sees_old_and_new() {
        let engine = solo_engine("node-a").await;
        let seen: Arc<std::sync::Mutex<Vec<(JsonValue, Option<JsonValue>)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.add_after_put(Arc::new(move |_path, new, old| {
            sink.lock()
                .unwrap()
                .push((new.clone(), old.map(|v| v.clone())));
        }));

        engine.put("x", json!(1)).await.unwrap();
        engine.put("x", json!(2)).await.unwrap();

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (json!(1), None));
        assert_eq!(calls[1], (json!(2), Some(json!(1))));
    }

    #[tokio::test]
    async fn test_draining_refuses_quietly() {
        let engine = solo_engine("node-a").await;
        engine.put("x", json!(1)).await.unwrap();

        engine.prepare_shutdown().await;
        assert_eq!(engine.lifecycle().await, Lifecycle::Draining);

        // Mutations are quiet no-ops.
        assert_eq!(engine.put("x", json!(2)).await.unwrap(), PutOutcome::Draining);
        assert_eq!(engine.get("x").await.unwrap(), Some(json!(1)));

        // Incoming PUTs are ignored.
        assert_eq!(
            engine
                .handle_incoming(remote_put("x", json!(3), "node-b", 1))
                .await
                .unwrap(),
            IngressOutcome::Draining
        );

        // New subscriptions are refused with an explicit error.
        assert!(matches!(
            engine.subscribe("x").await,
            Err(MeshError::Draining)
        ));
    }

    #[tokio::test]
    async fn test_close_transitions_to_closed() {
        let engine = solo_engine("node-a").await;
        engine.put("x", json!(1)).await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(engine.lifecycle().await, Lifecycle::Closed);
    }

    #[tokio::test]
    async fn test_concurrent_remote_updates_resolve_deterministically() {
        let engine = solo_engine("node-a").await;

        engine
            .handle_incoming(remote_put("x", json!("from-b"), "node-b", 1))
            .await
            .unwrap();
        engine
            .handle_incoming(remote_put("x", json!("from-z"), "node-z", 1))
            .await
            .unwrap();

        // node-z sorts above node-b in the deterministic tiebreak.
        assert_eq!(engine.get("x").await.unwrap(), Some(json!("from-z")));
    }

    #[tokio::test]
    async fn test_processed_entries_expire() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.register(NodeId::new("node-a")));
        let engine = ReplicationEngine::start(
            MeshConfig::new()
                .node_id("node-a")
                .max_message_age(Duration::from_millis(20)),
            Arc::new(MemoryStore::new()),
            transport,
        )
        .await
        .unwrap();

        let msg = remote_put("x", json!(1), "node-b", 1);
        engine.handle_incoming(msg.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Trigger a prune via another write; the old id is forgotten and
        // the replay resolves idempotently instead of being de-duped.
        engine.put("y", json!(2)).await.unwrap();
        assert_eq!(
            engine.handle_incoming(msg).await.unwrap(),
            IngressOutcome::Applied
        );
        assert_eq!(engine.get("x").await.unwrap(), Some(json!(1)));
    }
}
