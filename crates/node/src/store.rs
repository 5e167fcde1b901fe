use anyhow::Context;
use sled::Db;
use std::path::Path;

const USED_BYTES_KEY: &[u8] = b"__meta:used_bytes";
const CHUNK_PREFIX: &str = "c:";

/// Local replica store backed by sled, with used-bytes accounting so the
/// node can refuse writes past its allocated capacity and advertise its
/// remaining free storage on every re-auth.
pub struct BlockStore {
    db: Db,
    max_bytes: u64,
}

impl BlockStore {
    pub fn open(storage_path: &Path, max_gb: u64) -> anyhow::Result<Self> {
        let db = sled::open(storage_path).context("failed to open local block store")?;
        let max_bytes = max_gb
            .saturating_mul(1024)
            .saturating_mul(1024)
            .saturating_mul(1024);
        tracing::info!(
            "block store ready at {}: {} GB allocated, {} bytes used",
            storage_path.display(),
            max_gb,
            read_used_bytes(&db).unwrap_or(0)
        );
        Ok(Self { db, max_bytes })
    }

    /// Persist chunk bytes. Returns `false` when the write would exceed the
    /// allocated capacity; the coordinator simply never gets a confirmation.
    pub fn save_chunk(&self, chunk_id: &str, data: &[u8]) -> Result<bool, sled::Error> {
        let key = chunk_key(chunk_id);
        let existing_len = self.db.get(&key)?.map(|v| v.len() as u64).unwrap_or(0);
        let used_bytes = read_used_bytes(&self.db)?;

        let projected = used_bytes
            .saturating_sub(existing_len)
            .saturating_add(data.len() as u64);
        if projected > self.max_bytes {
            return Ok(false);
        }

        self.db.insert(key, data)?;
        write_used_bytes(&self.db, projected)?;
        Ok(true)
    }

    pub fn load_chunk(&self, chunk_id: &str) -> Result<Option<Vec<u8>>, sled::Error> {
        Ok(self.db.get(chunk_key(chunk_id))?.map(|v| v.to_vec()))
    }

    pub fn used_bytes(&self) -> u64 {
        read_used_bytes(&self.db).unwrap_or(0)
    }

    pub fn free_bytes(&self) -> u64 {
        self.max_bytes.saturating_sub(self.used_bytes())
    }
}

fn chunk_key(chunk_id: &str) -> String {
    format!("{CHUNK_PREFIX}{chunk_id}")
}

fn read_used_bytes(db: &Db) -> Result<u64, sled::Error> {
    let Some(v) = db.get(USED_BYTES_KEY)? else {
        return Ok(0);
    };
    if v.len() != 8 {
        return Ok(0);
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&v);
    Ok(u64::from_le_bytes(arr))
}

fn write_used_bytes(db: &Db, bytes: u64) -> Result<(), sled::Error> {
    db.insert(USED_BYTES_KEY, bytes.to_le_bytes().to_vec())?;
    Ok(())
}
