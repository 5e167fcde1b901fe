//! Chunk Ledger: chunk identity, replica sets and replica-count-derived
//! status. Replica uniqueness is enforced by the storage layer
//! (`PRIMARY KEY (chunk_id, peer_id)`), so concurrent confirmations for the
//! same pair collapse into one record no matter how callbacks interleave.

use hive_protocol::ChunkStatus;
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Outcome of a replica-count recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub replica_count: i64,
    pub previous: ChunkStatus,
    pub current: ChunkStatus,
}

impl StatusChange {
    /// True when this recompute crossed into `status` from something else.
    pub fn entered(&self, status: ChunkStatus) -> bool {
        self.current == status && self.previous != status
    }
}

/// A file whose last outstanding chunk just reached target replication.
#[derive(Debug, Clone)]
pub struct CompletedFile {
    pub file_id: String,
    pub user_id: i64,
    pub file_size_bytes: i64,
}

/// What a cascade delete removed, for cache invalidation and quota adjustment.
#[derive(Debug, Clone)]
pub struct FileDeletion {
    pub user_id: i64,
    pub file_size_bytes: i64,
    pub chunk_ids: Vec<String>,
}

pub async fn create_file(
    db: &SqlitePool,
    file_id: &str,
    user_id: i64,
    filename: &str,
    file_size_bytes: i64,
    total_chunks: i64,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO files (id, user_id, filename, file_size_bytes, total_chunks) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(file_id)
    .bind(user_id)
    .bind(filename)
    .bind(file_size_bytes)
    .bind(total_chunks)
    .execute(db)
    .await?;
    Ok(())
}

/// Insert a chunk row. Returns `false` when the (file, index) slot is
/// already taken — the uniqueness constraint is the arbiter, not a prior
/// read.
pub async fn insert_chunk(
    db: &SqlitePool,
    chunk_id: &str,
    file_id: &str,
    chunk_index: i64,
    chunk_hash: &str,
) -> Result<bool, LedgerError> {
    let result = sqlx::query(
        "INSERT INTO chunks (id, file_id, chunk_index, chunk_hash) VALUES (?, ?, ?, ?)",
    )
    .bind(chunk_id)
    .bind(file_id)
    .bind(chunk_index)
    .bind(chunk_hash)
    .execute(db)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Stamp the moment a chunk's fan-out began; the reconciler treats a chunk
/// still unconfirmed past the placement deadline as a placement failure.
pub async fn mark_placed(db: &SqlitePool, chunk_id: &str, now: i64) -> Result<(), LedgerError> {
    sqlx::query("UPDATE chunks SET placed_at = ? WHERE id = ?")
        .bind(now)
        .bind(chunk_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Record a confirmed replica. Duplicate confirmations for the same
/// (chunk, peer) pair are no-ops; returns whether the record is new.
pub async fn record_replica(
    db: &SqlitePool,
    chunk_id: &str,
    peer_id: i64,
) -> Result<bool, LedgerError> {
    let result = sqlx::query(
        "INSERT INTO chunk_replicas (chunk_id, peer_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(chunk_id)
    .bind(peer_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Remove a replica record after a loss report. Returns whether a record
/// existed.
pub async fn remove_replica(
    db: &SqlitePool,
    chunk_id: &str,
    peer_id: i64,
) -> Result<bool, LedgerError> {
    let result = sqlx::query("DELETE FROM chunk_replicas WHERE chunk_id = ? AND peer_id = ?")
        .bind(chunk_id)
        .bind(peer_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Peers currently recorded as holding a replica of the chunk.
pub async fn replica_holders(db: &SqlitePool, chunk_id: &str) -> Result<Vec<i64>, LedgerError> {
    let rows: Vec<i64> =
        sqlx::query_scalar("SELECT peer_id FROM chunk_replicas WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_all(db)
            .await?;
    Ok(rows)
}

/// Recount distinct confirmed replicas and map the count through the status
/// thresholds. Returns `None` when the chunk row no longer exists (deleted
/// mid-flight).
pub async fn recompute_status(
    db: &SqlitePool,
    chunk_id: &str,
) -> Result<Option<StatusChange>, LedgerError> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM chunks WHERE id = ?")
        .bind(chunk_id)
        .fetch_optional(db)
        .await?;
    let Some(status) = status else {
        return Ok(None);
    };
    let previous = ChunkStatus::parse(&status).unwrap_or(ChunkStatus::Pending);

    let replica_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunk_replicas WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_one(db)
            .await?;
    let current = ChunkStatus::for_replica_count(replica_count);

    sqlx::query("UPDATE chunks SET replica_count = ?, status = ? WHERE id = ?")
        .bind(replica_count)
        .bind(current.as_str())
        .bind(chunk_id)
        .execute(db)
        .await?;

    Ok(Some(StatusChange {
        replica_count,
        previous,
        current,
    }))
}

/// If every chunk of the file owning `chunk_id` has reached `ok`, flip the
/// file to complete and report it for quota bookkeeping.
pub async fn check_file_completion(
    db: &SqlitePool,
    chunk_id: &str,
) -> Result<Option<CompletedFile>, LedgerError> {
    let file_id: Option<String> = sqlx::query_scalar("SELECT file_id FROM chunks WHERE id = ?")
        .bind(chunk_id)
        .fetch_optional(db)
        .await?;
    let Some(file_id) = file_id else {
        return Ok(None);
    };

    let file: Option<(i64, i64, i64, String)> = sqlx::query_as(
        "SELECT user_id, total_chunks, file_size_bytes, upload_status FROM files WHERE id = ?",
    )
    .bind(&file_id)
    .fetch_optional(db)
    .await?;
    let Some((user_id, total_chunks, file_size_bytes, upload_status)) = file else {
        return Ok(None);
    };
    if upload_status == "complete" {
        return Ok(None);
    }

    let complete: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE file_id = ? AND status = 'ok'")
            .bind(&file_id)
            .fetch_one(db)
            .await?;
    if complete != total_chunks {
        return Ok(None);
    }

    sqlx::query("UPDATE files SET upload_status = 'complete', chunks_complete = ? WHERE id = ?")
        .bind(total_chunks)
        .bind(&file_id)
        .execute(db)
        .await?;
    tracing::info!("file complete: {}", file_id);

    Ok(Some(CompletedFile {
        file_id,
        user_id,
        file_size_bytes,
    }))
}

/// Delete a file and everything hanging off it: replica records, cached
/// bytes, chunk rows, then the file itself.
pub async fn delete_file(
    db: &SqlitePool,
    file_id: &str,
) -> Result<Option<FileDeletion>, LedgerError> {
    let file: Option<(i64, i64)> =
        sqlx::query_as("SELECT user_id, file_size_bytes FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_optional(db)
            .await?;
    let Some((user_id, file_size_bytes)) = file else {
        return Ok(None);
    };

    let chunk_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE file_id = ?")
        .bind(file_id)
        .fetch_all(db)
        .await?;

    sqlx::query(
        "DELETE FROM chunk_replicas WHERE chunk_id IN (SELECT id FROM chunks WHERE file_id = ?)",
    )
    .bind(file_id)
    .execute(db)
    .await?;
    sqlx::query(
        "DELETE FROM cached_chunks WHERE chunk_id IN (SELECT id FROM chunks WHERE file_id = ?)",
    )
    .bind(file_id)
    .execute(db)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE file_id = ?")
        .bind(file_id)
        .execute(db)
        .await?;
    sqlx::query("DELETE FROM files WHERE id = ?")
        .bind(file_id)
        .execute(db)
        .await?;

    Ok(Some(FileDeletion {
        user_id,
        file_size_bytes,
        chunk_ids,
    }))
}

/// Bulk variant of [`delete_file`] covering every file a user owns.
pub async fn delete_user_files(
    db: &SqlitePool,
    user_id: i64,
) -> Result<FileDeletion, LedgerError> {
    let total_bytes: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(file_size_bytes), 0) FROM files WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_one(db)
    .await?;

    let chunk_ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM chunks WHERE file_id IN (SELECT id FROM files WHERE user_id = ?)",
    )
    .bind(user_id)
    .fetch_all(db)
    .await?;

    sqlx::query(
        "DELETE FROM chunk_replicas WHERE chunk_id IN (SELECT id FROM chunks WHERE file_id IN (SELECT id FROM files WHERE user_id = ?))",
    )
    .bind(user_id)
    .execute(db)
    .await?;
    sqlx::query(
        "DELETE FROM cached_chunks WHERE chunk_id IN (SELECT id FROM chunks WHERE file_id IN (SELECT id FROM files WHERE user_id = ?))",
    )
    .bind(user_id)
    .execute(db)
    .await?;
    sqlx::query("DELETE FROM chunks WHERE file_id IN (SELECT id FROM files WHERE user_id = ?)")
        .bind(user_id)
        .execute(db)
        .await?;
    sqlx::query("DELETE FROM files WHERE user_id = ?")
        .bind(user_id)
        .execute(db)
        .await?;

    Ok(FileDeletion {
        user_id,
        file_size_bytes: total_bytes,
        chunk_ids,
    })
}
