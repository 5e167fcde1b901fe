use chrono::NaiveDateTime;
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Peer {
    pub id: i64,
    pub user_id: i64,
    pub peer_secret: Option<String>,
    pub online: bool,
    pub last_seen: Option<i64>,
    pub session_id: Option<String>,
    pub free_storage_bytes: i64,
    pub chunks_stored: i64,
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: String,
    pub user_id: i64,
    pub filename: String,
    pub file_size_bytes: i64,
    pub total_chunks: i64,
    pub chunks_complete: i64,
    pub upload_status: String,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct Chunk {
    pub id: String,
    pub file_id: String,
    pub chunk_index: i64,
    pub chunk_hash: String,
    pub replica_count: i64,
    pub status: String,
    pub placed_at: Option<i64>,
}

// ── API Payloads ────────────────────────────────────────────────
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInitRequest {
    pub user_id: i64,
    pub filename: String,
    pub file_size: i64,
    pub total_chunks: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkQuery {
    pub file_id: String,
    pub chunk_index: i64,
    pub chunk_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub chunk_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: i64,
    pub exp: usize,
}

/// Coordinator-issued identifier: 16 random bytes, hex-encoded. Used for
/// file ids, chunk ids, session ids and retrieval request ids.
pub fn new_hex_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
