//! Peer Registry: authoritative record of known peers, their shared secret,
//! presence and advertised capacity.

use sqlx::SqlitePool;

use crate::ledger::LedgerError;

/// A peer eligible to receive a chunk during placement.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlacementCandidate {
    pub id: i64,
    pub free_storage_bytes: i64,
}

/// Authenticate a peer, adopting the presented secret on first contact and
/// verifying it thereafter. A mismatched secret yields `Ok(None)` — the
/// caller grants no session and sends no error frame.
///
/// On success the peer is marked online, its last-seen timestamp and
/// advertised free storage are refreshed, and `session_id` becomes its
/// current routing address.
pub async fn authenticate(
    db: &SqlitePool,
    user_id: i64,
    peer_secret: &str,
    free_storage_bytes: i64,
    session_id: &str,
    now: i64,
) -> Result<Option<i64>, LedgerError> {
    let stored: Option<Option<String>> =
        sqlx::query_scalar("SELECT peer_secret FROM peers WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(db)
            .await?;

    if let Some(Some(existing)) = stored {
        if existing != peer_secret {
            return Ok(None);
        }
    }

    sqlx::query(
        r#"
        INSERT INTO peers (user_id, peer_secret, online, last_seen, session_id, free_storage_bytes)
        VALUES (?, ?, 1, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            online = 1,
            last_seen = excluded.last_seen,
            session_id = excluded.session_id,
            free_storage_bytes = excluded.free_storage_bytes,
            peer_secret = COALESCE(peer_secret, excluded.peer_secret)
        "#,
    )
    .bind(user_id)
    .bind(peer_secret)
    .bind(now)
    .bind(session_id)
    .bind(free_storage_bytes)
    .execute(db)
    .await?;

    let peer_id: i64 = sqlx::query_scalar("SELECT id FROM peers WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(db)
        .await?;

    Ok(Some(peer_id))
}

/// All currently-online peers, unranked. Ranking and tie-breaking happen in
/// [`crate::replication::rank_placement`] so the selection is testable with
/// a seeded rng.
pub async fn placement_candidates(
    db: &SqlitePool,
) -> Result<Vec<PlacementCandidate>, LedgerError> {
    let rows = sqlx::query_as::<_, PlacementCandidate>(
        "SELECT id, free_storage_bytes FROM peers WHERE online = 1",
    )
    .fetch_all(db)
    .await?;
    Ok(rows)
}

/// Mark a single peer offline (socket closed).
pub async fn mark_offline(db: &SqlitePool, peer_id: i64) -> Result<(), LedgerError> {
    sqlx::query("UPDATE peers SET online = 0 WHERE id = ?")
        .bind(peer_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Mark every online peer whose last heartbeat predates `cutoff` as offline
/// and clear its session binding. Returns the invalidated session ids.
pub async fn reap_silent_peers(
    db: &SqlitePool,
    cutoff: i64,
) -> Result<Vec<String>, LedgerError> {
    let stale: Vec<(i64, Option<String>)> = sqlx::query_as(
        "SELECT id, session_id FROM peers WHERE online = 1 AND (last_seen IS NULL OR last_seen < ?)",
    )
    .bind(cutoff)
    .fetch_all(db)
    .await?;

    let mut invalidated = Vec::new();
    for (peer_id, session_id) in stale {
        sqlx::query("UPDATE peers SET online = 0, session_id = NULL WHERE id = ?")
            .bind(peer_id)
            .execute(db)
            .await?;
        tracing::info!("peer {} marked offline (heartbeat timeout)", peer_id);
        if let Some(session_id) = session_id {
            invalidated.push(session_id);
        }
    }
    Ok(invalidated)
}

/// Bump a peer's contribution counter after a genuinely new replica record.
/// Returns the data the account-service sync needs.
pub async fn increment_contribution(
    db: &SqlitePool,
    peer_id: i64,
) -> Result<Option<(i64, i64)>, LedgerError> {
    sqlx::query("UPDATE peers SET chunks_stored = chunks_stored + 1 WHERE id = ?")
        .bind(peer_id)
        .execute(db)
        .await?;

    let row: Option<(i64, i64)> =
        sqlx::query_as("SELECT user_id, chunks_stored FROM peers WHERE id = ?")
            .bind(peer_id)
            .fetch_optional(db)
            .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool");
        crate::MIGRATOR.run(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn first_auth_adopts_secret_and_later_mismatch_is_rejected() {
        let db = pool().await;

        let peer_id = authenticate(&db, 42, "original-secret", 1024, "sess-1", 100)
            .await
            .unwrap()
            .expect("first auth must grant a session");

        let rejected = authenticate(&db, 42, "forged-secret", 1024, "sess-2", 200)
            .await
            .unwrap();
        assert!(rejected.is_none(), "mismatched secret must be silently rejected");

        let peer: crate::models::Peer =
            sqlx::query_as("SELECT * FROM peers WHERE user_id = 42")
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(peer.id, peer_id);
        assert_eq!(peer.peer_secret.as_deref(), Some("original-secret"));
        assert_eq!(peer.session_id.as_deref(), Some("sess-1"));
        assert_eq!(peer.last_seen, Some(100), "rejected auth must not refresh last_seen");
    }

    #[tokio::test]
    async fn reauth_refreshes_presence_and_supersedes_session() {
        let db = pool().await;

        let first = authenticate(&db, 7, "s", 10, "sess-a", 100).await.unwrap();
        let second = authenticate(&db, 7, "s", 20, "sess-b", 500).await.unwrap();
        assert_eq!(first, second, "same user keeps the same peer id");

        let peer: crate::models::Peer =
            sqlx::query_as("SELECT * FROM peers WHERE user_id = 7")
                .fetch_one(&db)
                .await
                .unwrap();
        assert!(peer.online);
        assert_eq!(peer.last_seen, Some(500));
        assert_eq!(peer.session_id.as_deref(), Some("sess-b"));
        assert_eq!(peer.free_storage_bytes, 20);
    }

    #[tokio::test]
    async fn silent_peers_are_reaped_past_the_cutoff() {
        let db = pool().await;
        authenticate(&db, 1, "a", 0, "sess-old", 100).await.unwrap();
        authenticate(&db, 2, "b", 0, "sess-fresh", 900).await.unwrap();

        let invalidated = reap_silent_peers(&db, 600).await.unwrap();
        assert_eq!(invalidated, vec!["sess-old".to_string()]);

        let online: Vec<i64> =
            sqlx::query_scalar("SELECT user_id FROM peers WHERE online = 1 ORDER BY user_id")
                .fetch_all(&db)
                .await
                .unwrap();
        assert_eq!(online, vec![2]);
    }
}
