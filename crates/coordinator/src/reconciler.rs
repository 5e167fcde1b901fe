//! Reconciliator: the periodic self-healing pass. Three independent,
//! idempotent sweeps per tick — reap silent peers, recompute chunk status,
//! drain the overflow cache — each safe to interleave with the online
//! request paths.

use chrono::Utc;
use hive_protocol::{ChunkStatus, PEER_STALE_AFTER, PLACEMENT_DEADLINE, RECONCILE_INTERVAL, REPLICA_TARGET};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{error, info};

use crate::cache::OverflowCache;
use crate::ledger::LedgerError;
use crate::registry;
use crate::swarm::SwarmCommand;

pub struct Reconciler {
    db: SqlitePool,
    cache: OverflowCache,
    hub_tx: mpsc::Sender<SwarmCommand>,
}

/// What the cache drain decided per cached chunk.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    pub redistribute: Vec<String>,
    pub evicted: Vec<String>,
}

impl Reconciler {
    pub fn new(db: SqlitePool, cache: OverflowCache, hub_tx: mpsc::Sender<SwarmCommand>) -> Self {
        Self { db, cache, hub_tx }
    }

    pub async fn start(&self) {
        info!(
            "reconciler initialized; sweeping swarm every {}s",
            RECONCILE_INTERVAL.as_secs()
        );
        let mut interval = time::interval(RECONCILE_INTERVAL);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One full reconciliation pass. Errors are logged and swallowed; the
    /// next tick retries from current state.
    pub async fn tick(&self) {
        let now = Utc::now().timestamp();

        match presence_sweep(&self.db, now).await {
            Ok(session_ids) if !session_ids.is_empty() => {
                let _ = self
                    .hub_tx
                    .send(SwarmCommand::InvalidateSessions { session_ids })
                    .await;
            }
            Ok(_) => {}
            Err(e) => error!("presence sweep failed: {}", e),
        }

        match status_sweep(&self.db, now).await {
            Ok(fills) => {
                for chunk_id in fills {
                    let _ = self.hub_tx.send(SwarmCommand::CacheFill { chunk_id }).await;
                }
            }
            Err(e) => error!("status sweep failed: {}", e),
        }

        match cache_drain(&self.db, &self.cache).await {
            Ok(outcome) => {
                for chunk_id in outcome.redistribute {
                    let _ = self
                        .hub_tx
                        .send(SwarmCommand::Redistribute { chunk_id })
                        .await;
                }
            }
            Err(e) => error!("cache drain failed: {}", e),
        }
    }
}

/// Pass 1: peers with no fresh heartbeat inside the staleness window go
/// offline and their session bindings are invalidated.
pub async fn presence_sweep(db: &SqlitePool, now: i64) -> Result<Vec<String>, LedgerError> {
    let cutoff = now - PEER_STALE_AFTER.as_secs() as i64;
    registry::reap_silent_peers(db, cutoff).await
}

/// Pass 2: recompute every chunk's status from its current replica count.
/// Returns the chunks that entered `warning` and need a cache fill.
///
/// `pending` chunks keep a grace period: they are only demoted once the
/// placement deadline has lapsed with no confirmation, at which point the
/// failed placement becomes eligible for redistribution from cache.
pub async fn status_sweep(db: &SqlitePool, now: i64) -> Result<Vec<String>, LedgerError> {
    let rows: Vec<(String, i64, String, Option<i64>)> =
        sqlx::query_as("SELECT id, replica_count, status, placed_at FROM chunks")
            .fetch_all(db)
            .await?;

    let mut fills = Vec::new();
    for (chunk_id, replica_count, status, placed_at) in rows {
        let previous = ChunkStatus::parse(&status).unwrap_or(ChunkStatus::Pending);
        if previous == ChunkStatus::Pending && replica_count == 0 {
            let deadline_lapsed = placed_at
                .map(|t| now - t >= PLACEMENT_DEADLINE.as_secs() as i64)
                .unwrap_or(false);
            if !deadline_lapsed {
                continue;
            }
        }

        let current = ChunkStatus::for_replica_count(replica_count);
        if current != previous {
            sqlx::query("UPDATE chunks SET status = ? WHERE id = ?")
                .bind(current.as_str())
                .bind(&chunk_id)
                .execute(db)
                .await?;
            if current == ChunkStatus::Warning {
                fills.push(chunk_id);
            }
        }
    }
    Ok(fills)
}

/// Pass 3: for every cached chunk, either attempt one redistribution (still
/// below target) or evict the now-redundant entry. Orphaned entries whose
/// chunk row is gone are evicted too.
pub async fn cache_drain(
    db: &SqlitePool,
    cache: &OverflowCache,
) -> Result<DrainOutcome, LedgerError> {
    let mut outcome = DrainOutcome::default();
    for chunk_id in cache.cached_chunk_ids().await? {
        let replicas: Option<i64> =
            sqlx::query_scalar("SELECT replica_count FROM chunks WHERE id = ?")
                .bind(&chunk_id)
                .fetch_optional(db)
                .await?;
        match replicas {
            Some(count) if count < REPLICA_TARGET => outcome.redistribute.push(chunk_id),
            _ => {
                cache.evict(&chunk_id).await?;
                outcome.evicted.push(chunk_id);
            }
        }
    }
    Ok(outcome)
}
