/// Background reconciliation.
///
/// Two cooperating periodic tasks recover whatever broadcast loses to
/// partitions, crashes, and dropped connections:
///
/// - **Vector-clock sync** (fast, default every 2 s) exchanges causal
///   summaries with every connected peer. This keeps `known_ids`
///   converged across the mesh and dampens spurious concurrent
///   classifications from sparse clocks.
/// - **Data reconciliation** (slow, opt-in) is pull-based: each cycle
///   asks every connected peer for its key range, and the peer streams
///   it back in paced batches. Entries are fed through the normal
///   ingress path flagged `anti_entropy`, so they resolve against the
///   local store but are never re-broadcast.
///
/// The responder streams its entire range rather than filtering by the
/// requester's clock: clock sync advances engine summaries without
/// moving data, so a summary comparison cannot tell which entries the
/// requester actually holds. Re-delivery is harmless because the
/// resolver is idempotent.
use crate::engine::{Lifecycle, ReplicationEngine};
use crate::transport::{ChangeRecord, WireMessage};
use crate::types::{now_ms, MessageId, NodeId};
use crate::clock::VectorClock;
use tokio::time::interval;
use tracing::{debug, trace, warn};

/// Start the periodic tasks for an engine.
///
/// Clock sync always runs; data reconciliation only when an interval is
/// configured. Both stop on the engine's shutdown signal.
pub(crate) fn spawn(engine: ReplicationEngine) {
    spawn_clock_sync(engine.clone());
    if engine.inner.config.anti_entropy_interval.is_some() {
        spawn_reconciliation(engine);
    }
}

fn spawn_clock_sync(engine: ReplicationEngine) {
    let period = engine.inner.config.clock_sync_interval;
    let mut shutdown_rx = engine.inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => sync_clocks(&engine).await,
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

fn spawn_reconciliation(engine: ReplicationEngine) {
    let Some(period) = engine.inner.config.anti_entropy_interval else {
        return;
    };
    let mut shutdown_rx = engine.inner.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => request_reconciliation(&engine).await,
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Emit a `vector-clock-sync` to every connected peer.
async fn sync_clocks(engine: &ReplicationEngine) {
    let clock = {
        let state = engine.inner.state.lock().await;
        if state.lifecycle != Lifecycle::Running {
            return;
        }
        state.clock.clone()
    };

    for peer in engine.inner.transport.connected_peers() {
        let message = WireMessage::VectorClockSync {
            clock: clock.clone(),
            node_id: engine.inner.node_id.clone(),
            sync_id: MessageId::random().as_str().to_string(),
            timestamp: now_ms(),
        };
        if let Err(e) = engine.inner.transport.send_to(&peer, message).await {
            debug!(peer = %peer, error = %e, "clock sync send failed");
        }
    }
}

/// Ask every connected peer for its key range.
async fn request_reconciliation(engine: &ReplicationEngine) {
    let clock = {
        let state = engine.inner.state.lock().await;
        if state.lifecycle != Lifecycle::Running {
            return;
        }
        state.clock.clone()
    };

    let peers = engine.inner.transport.connected_peers();
    if peers.is_empty() {
        return;
    }
    trace!(peers = peers.len(), "starting reconciliation cycle");

    for peer in peers {
        let message = WireMessage::AntiEntropyRequest {
            request_id: MessageId::random().as_str().to_string(),
            node_id: engine.inner.node_id.clone(),
            clock: clock.clone(),
            timestamp: now_ms(),
        };
        if let Err(e) = engine.inner.transport.send_to(&peer, message).await {
            debug!(peer = %peer, error = %e, "reconciliation request failed");
        }
    }
}

/// Serve one reconciliation request in a task of its own, so pacing
/// never blocks normal ingress.
pub(crate) fn spawn_responder(
    engine: ReplicationEngine,
    requester: NodeId,
    request_id: String,
    _requester_clock: VectorClock,
) {
    tokio::spawn(async move {
        stream_range(&engine, requester, request_id).await;
    });
}

async fn stream_range(engine: &ReplicationEngine, requester: NodeId, request_id: String) {
    {
        let state = engine.inner.state.lock().await;
        if state.lifecycle != Lifecycle::Running {
            return;
        }
    }

    let entries = match engine.inner.store.scan("").await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "reconciliation scan failed");
            return;
        }
    };
    if entries.is_empty() {
        return;
    }

    let batch_size = engine.inner.config.batch_size.max(1);
    let total_batches = entries.len().div_ceil(batch_size);

    for (batch_index, chunk) in entries.chunks(batch_size).enumerate() {
        // Shutting down mid-exchange drops the remaining batches.
        {
            let state = engine.inner.state.lock().await;
            if state.lifecycle != Lifecycle::Running {
                return;
            }
        }

        let clock = engine.inner.state.lock().await.clock.clone();
        let changes: Vec<ChangeRecord> = chunk
            .iter()
            .map(|(path, vv)| ChangeRecord {
                path: path.clone(),
                value: vv.value.clone(),
                timestamp: vv.timestamp,
                origin: vv.origin.clone(),
                clock: vv.clock.clone(),
            })
            .collect();

        let message = WireMessage::AntiEntropyResponse {
            response_id: request_id.clone(),
            node_id: engine.inner.node_id.clone(),
            clock,
            batch_index,
            total_batches,
            changes,
        };

        if let Err(e) = engine.inner.transport.send_to(&requester, message).await {
            debug!(peer = %requester, error = %e, "reconciliation batch send failed");
            return;
        }

        trace!(
            peer = %requester,
            batch = batch_index + 1,
            of = total_batches,
            "sent reconciliation batch"
        );
        tokio::time::sleep(engine.inner.config.batch_pause).await;
    }
}
