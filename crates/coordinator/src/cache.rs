//! Overflow Cache: coordinator-local copy of chunk bytes held while the
//! swarm is below the replication target, and the replication source of
//! last resort for the reconciler's redistribution pass.
//!
//! The durable `cached_chunks` table is authoritative; a moka layer in
//! front of it absorbs repeated reads of hot chunks. Both layers are
//! dropped together on eviction.

use bytes::Bytes;
use moka::future::Cache;
use sqlx::SqlitePool;

use crate::ledger::LedgerError;

const HOT_CAPACITY: u64 = 1024;

#[derive(Clone)]
pub struct OverflowCache {
    db: SqlitePool,
    hot: Cache<String, Bytes>,
}

impl OverflowCache {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            hot: Cache::new(HOT_CAPACITY),
        }
    }

    /// Store (or replace) the cached bytes for a chunk.
    pub async fn put(&self, chunk_id: &str, bytes: &[u8]) -> Result<(), LedgerError> {
        sqlx::query("INSERT OR REPLACE INTO cached_chunks (chunk_id, chunk_data) VALUES (?, ?)")
            .bind(chunk_id)
            .bind(bytes)
            .execute(&self.db)
            .await?;
        self.hot
            .insert(chunk_id.to_string(), Bytes::copy_from_slice(bytes))
            .await;
        Ok(())
    }

    /// Fetch cached bytes, promoting durable hits into the hot layer.
    pub async fn get(&self, chunk_id: &str) -> Result<Option<Bytes>, LedgerError> {
        if let Some(bytes) = self.hot.get(chunk_id).await {
            return Ok(Some(bytes));
        }
        let row: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT chunk_data FROM cached_chunks WHERE chunk_id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.db)
                .await?;
        match row {
            Some(data) => {
                let bytes = Bytes::from(data);
                self.hot.insert(chunk_id.to_string(), bytes.clone()).await;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    pub async fn contains(&self, chunk_id: &str) -> Result<bool, LedgerError> {
        if self.hot.contains_key(chunk_id) {
            return Ok(true);
        }
        let row: Option<String> =
            sqlx::query_scalar("SELECT chunk_id FROM cached_chunks WHERE chunk_id = ?")
                .bind(chunk_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.is_some())
    }

    /// Drop a cache entry. Called once a chunk reaches target replication,
    /// and by the deletion cascade.
    pub async fn evict(&self, chunk_id: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM cached_chunks WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.db)
            .await?;
        self.hot.invalidate(chunk_id).await;
        Ok(())
    }

    /// Drop hot-layer entries whose durable rows were already removed by a
    /// cascade delete.
    pub async fn forget_hot(&self, chunk_ids: &[String]) {
        for chunk_id in chunk_ids {
            self.hot.invalidate(chunk_id).await;
        }
    }

    /// Every chunk currently held in the durable cache, for the drain pass.
    pub async fn cached_chunk_ids(&self) -> Result<Vec<String>, LedgerError> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT chunk_id FROM cached_chunks")
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn cache() -> OverflowCache {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool");
        crate::MIGRATOR.run(&pool).await.expect("migrations");
        OverflowCache::new(pool)
    }

    #[tokio::test]
    async fn put_get_evict_round_trip() {
        let cache = cache().await;
        let bytes = b"encrypted-chunk-bytes".to_vec();

        cache.put("c1", &bytes).await.unwrap();
        assert!(cache.contains("c1").await.unwrap());
        assert_eq!(cache.get("c1").await.unwrap().as_deref(), Some(&bytes[..]));

        cache.evict("c1").await.unwrap();
        assert!(!cache.contains("c1").await.unwrap());
        assert!(cache.get("c1").await.unwrap().is_none());
        assert!(cache.cached_chunk_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn durable_rows_survive_a_cold_hot_layer() {
        let cache = cache().await;
        cache.put("c2", b"payload").await.unwrap();

        // A fresh handle over the same pool simulates a hot layer that has
        // never seen the entry.
        let cold = OverflowCache::new(cache.db.clone());
        assert_eq!(
            cold.get("c2").await.unwrap().as_deref(),
            Some(&b"payload"[..])
        );
    }
}
