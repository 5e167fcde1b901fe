//! Replication Manager: placement of new chunks, storage confirmations and
//! loss reports, and the replica-count-derived status transitions that
//! drive cache fills and file completion.

use bytes::Bytes;
use hive_protocol::{encode_chunk, ChunkStatus, PeerMessage, RetrievePurpose, PLACEMENT_FANOUT};
use rand::Rng;
use sqlx::SqlitePool;
use tracing::{debug, error, warn};

use crate::ledger::{self, CompletedFile, LedgerError, StatusChange};
use crate::notify::gigabytes;
use crate::registry::{self, PlacementCandidate};
use crate::swarm::SwarmHub;

/// Rank placement candidates by descending advertised free storage, breaking
/// ties randomly, and keep the top `limit`. The rng is caller-supplied so
/// tests can seed it.
pub fn rank_placement<R: Rng>(
    candidates: Vec<PlacementCandidate>,
    limit: usize,
    rng: &mut R,
) -> Vec<PlacementCandidate> {
    let mut keyed: Vec<(i64, u64, PlacementCandidate)> = candidates
        .into_iter()
        .map(|c| (c.free_storage_bytes, rng.gen::<u64>(), c))
        .collect();
    keyed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    keyed.into_iter().take(limit).map(|(_, _, c)| c).collect()
}

/// Result of applying a `chunk_stored` confirmation to the ledger.
#[derive(Debug)]
pub enum StoredApplied {
    /// The (chunk, peer) pair was already recorded; nothing changed.
    Duplicate,
    /// The chunk row is gone (file deleted mid-flight); the confirmation is
    /// discarded.
    UnknownChunk,
    Recorded(StoredOutcome),
}

#[derive(Debug)]
pub struct StoredOutcome {
    pub change: StatusChange,
    /// (user_id, chunks_stored) for the account-service sync, present for
    /// genuinely new records only.
    pub contribution: Option<(i64, i64)>,
    pub completed_file: Option<CompletedFile>,
}

/// Ledger effects of a storage confirmation. Idempotent: the storage-layer
/// uniqueness constraint decides whether the record is new, so interleaved
/// duplicate confirmations cannot double-count.
pub async fn apply_stored(
    db: &SqlitePool,
    chunk_id: &str,
    peer_id: i64,
) -> Result<StoredApplied, LedgerError> {
    if !ledger::record_replica(db, chunk_id, peer_id).await? {
        return Ok(StoredApplied::Duplicate);
    }

    let Some(change) = ledger::recompute_status(db, chunk_id).await? else {
        // Chunk deleted while the confirmation was in flight; drop the
        // dangling record.
        ledger::remove_replica(db, chunk_id, peer_id).await?;
        return Ok(StoredApplied::UnknownChunk);
    };

    let contribution = registry::increment_contribution(db, peer_id).await?;
    let completed_file = if change.entered(ChunkStatus::Ok) {
        ledger::check_file_completion(db, chunk_id).await?
    } else {
        None
    };

    Ok(StoredApplied::Recorded(StoredOutcome {
        change,
        contribution,
        completed_file,
    }))
}

/// Ledger effects of a loss report: drop the replica record and recompute.
/// Returns `None` when the chunk row no longer exists.
pub async fn apply_missing(
    db: &SqlitePool,
    chunk_id: &str,
    peer_id: i64,
) -> Result<Option<StatusChange>, LedgerError> {
    ledger::remove_replica(db, chunk_id, peer_id).await?;
    ledger::recompute_status(db, chunk_id).await
}

impl SwarmHub {
    /// Best-effort fan-out of a freshly uploaded chunk to the top-ranked
    /// online peers. Placement success is observed asynchronously through
    /// `chunk_stored` confirmations; nobody blocks on this.
    pub(crate) async fn distribute(&mut self, chunk_id: String, bytes: Bytes) {
        let candidates = match registry::placement_candidates(&self.db).await {
            Ok(c) => c,
            Err(e) => {
                error!("placement query failed for chunk {}: {}", chunk_id, e);
                return;
            }
        };
        let chosen = rank_placement(candidates, PLACEMENT_FANOUT, &mut self.rng);
        if chosen.is_empty() {
            warn!(
                "no online peers to place chunk {}; leaving it pending",
                chunk_id
            );
            return;
        }

        let encoded = encode_chunk(&bytes);
        let mut sent = 0;
        for candidate in &chosen {
            if let Some(session) = self.session_for_peer(candidate.id) {
                if session
                    .tx
                    .send(PeerMessage::StoreChunk {
                        chunk_id: chunk_id.clone(),
                        chunk_data: encoded.clone(),
                    })
                    .is_ok()
                {
                    sent += 1;
                }
            }
        }
        debug!("distributed chunk {} to {} peers", chunk_id, sent);
    }

    pub(crate) async fn on_stored(&mut self, chunk_id: String, peer_id: i64) {
        match apply_stored(&self.db, &chunk_id, peer_id).await {
            Ok(StoredApplied::Recorded(outcome)) => {
                if let Some((user_id, chunks_stored)) = outcome.contribution {
                    let notifier = self.notifier.clone();
                    tokio::spawn(async move {
                        notifier.sync_contribution(user_id, chunks_stored).await;
                    });
                }
                if let Some(done) = outcome.completed_file {
                    let notifier = self.notifier.clone();
                    tokio::spawn(async move {
                        notifier
                            .update_storage(done.user_id, gigabytes(done.file_size_bytes))
                            .await;
                    });
                }
                if outcome.change.entered(ChunkStatus::Warning) {
                    self.cache_fill(&chunk_id).await;
                }
            }
            Ok(StoredApplied::Duplicate) => {
                debug!(
                    "duplicate confirmation for chunk {} from peer {}",
                    chunk_id, peer_id
                );
            }
            Ok(StoredApplied::UnknownChunk) => {
                debug!("confirmation for unknown chunk {}; dropped", chunk_id);
            }
            Err(e) => error!("failed to record replica for chunk {}: {}", chunk_id, e),
        }
    }

    pub(crate) async fn on_missing(
        &mut self,
        chunk_id: String,
        peer_id: i64,
        request_id: Option<String>,
    ) {
        let change = match apply_missing(&self.db, &chunk_id, peer_id).await {
            Ok(change) => change,
            Err(e) => {
                error!("failed to remove replica for chunk {}: {}", chunk_id, e);
                return;
            }
        };
        if let Some(change) = &change {
            warn!(
                "chunk {} lost by peer {}; replica count now {}",
                chunk_id, peer_id, change.replica_count
            );
        }

        // A retrieval was waiting on this peer: reroute it. The pending
        // record's own purpose is authoritative, not the echoed field.
        if let Some(request_id) = request_id {
            if let Some(pending) = self.pending.remove(&request_id) {
                match pending.purpose {
                    Some(RetrievePurpose::Cache) => self.cache_fill(&chunk_id).await,
                    None => {
                        if let Some(requester) = pending.requester {
                            self.route(&requester, &chunk_id).await;
                        }
                    }
                }
            }
        }

        // Cache fills are tied to the warning band, not the full
        // below-target range: a single lost replica out of five leaves the
        // chunk at `attention` with no coordinator copy yet.
        if change.map_or(false, |c| c.current == ChunkStatus::Warning) {
            self.cache_fill(&chunk_id).await;
        }
    }
}
