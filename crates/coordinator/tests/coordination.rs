// Coordination-path integration tests: placement ranking, confirmation and
// loss bookkeeping, reconciliation sweeps and deletion cascades, all driven
// against an in-memory ledger.

use hive_coordinator::cache::OverflowCache;
use hive_coordinator::ledger;
use hive_coordinator::reconciler::{cache_drain, status_sweep};
use hive_coordinator::registry;
use hive_coordinator::replication::{apply_missing, apply_stored, rank_placement, StoredApplied};
use hive_protocol::{ChunkStatus, REPLICA_TARGET};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

async fn memory_pool() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("memory pool");
    hive_coordinator::MIGRATOR.run(&pool).await.expect("migrations");
    pool
}

async fn seed_peer(db: &SqlitePool, user_id: i64, free_storage: i64, online: bool) -> i64 {
    sqlx::query(
        "INSERT INTO peers (user_id, peer_secret, online, last_seen, session_id, free_storage_bytes)
         VALUES (?, 'secret', ?, 1000, ?, ?)",
    )
    .bind(user_id)
    .bind(online)
    .bind(format!("sess-{user_id}"))
    .bind(free_storage)
    .execute(db)
    .await
    .expect("seed peer");

    sqlx::query_scalar("SELECT id FROM peers WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(db)
        .await
        .expect("peer id")
}

async fn seed_chunk(db: &SqlitePool, file_id: &str, chunk_id: &str, index: i64) {
    ledger::insert_chunk(db, chunk_id, file_id, index, "deadbeef")
        .await
        .expect("seed chunk");
}

async fn chunk_state(db: &SqlitePool, chunk_id: &str) -> (i64, String) {
    sqlx::query_as("SELECT replica_count, status FROM chunks WHERE id = ?")
        .bind(chunk_id)
        .fetch_one(db)
        .await
        .expect("chunk state")
}

#[tokio::test]
async fn placement_picks_the_highest_free_storage_online_peers() {
    let db = memory_pool().await;
    let mut expected = Vec::new();
    for (user, free) in [(1, 700), (2, 600), (3, 500), (4, 400), (5, 300)] {
        expected.push(seed_peer(&db, user, free, true).await);
    }
    // Smaller online peers and a huge offline one must never be picked.
    seed_peer(&db, 6, 200, true).await;
    seed_peer(&db, 7, 100, true).await;
    seed_peer(&db, 8, 999_999, false).await;

    let candidates = registry::placement_candidates(&db).await.unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let chosen = rank_placement(candidates, 5, &mut rng);

    let chosen_ids: Vec<i64> = chosen.iter().map(|c| c.id).collect();
    assert_eq!(
        chosen_ids, expected,
        "exactly the five best-provisioned online peers, best first"
    );
}

#[tokio::test]
async fn placement_tie_break_is_deterministic_under_a_seed() {
    let db = memory_pool().await;
    for user in 1..=4 {
        seed_peer(&db, user, 500, true).await;
    }

    let candidates = registry::placement_candidates(&db).await.unwrap();
    let first = rank_placement(candidates.clone(), 2, &mut StdRng::seed_from_u64(7));
    let second = rank_placement(candidates, 2, &mut StdRng::seed_from_u64(7));

    let first_ids: Vec<i64> = first.iter().map(|c| c.id).collect();
    let second_ids: Vec<i64> = second.iter().map(|c| c.id).collect();
    assert_eq!(first_ids, second_ids, "same seed must pick the same peers");
}

#[tokio::test]
async fn small_swarm_stays_in_warning_and_keeps_the_cache_entry() {
    let db = memory_pool().await;
    let cache = OverflowCache::new(db.clone());
    let peers = [
        seed_peer(&db, 1, 100, true).await,
        seed_peer(&db, 2, 10, true).await,
        seed_peer(&db, 3, 1, true).await,
    ];

    ledger::create_file(&db, "f1", 9, "vault.bin", 4096, 1)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c1", 0).await;
    cache.put("c1", b"staged-at-upload").await.unwrap();

    let mut entered_warning = false;
    for peer_id in peers {
        match apply_stored(&db, "c1", peer_id).await.unwrap() {
            StoredApplied::Recorded(outcome) => {
                entered_warning |= outcome.change.entered(ChunkStatus::Warning);
            }
            other => panic!("confirmation must be recorded, got {other:?}"),
        }
    }
    assert!(entered_warning, "first confirmation must cross into warning");

    let (replicas, status) = chunk_state(&db, "c1").await;
    assert_eq!(replicas, 3);
    assert_eq!(status, "warning");

    let outcome = cache_drain(&db, &cache).await.unwrap();
    assert_eq!(
        outcome.redistribute,
        vec!["c1".to_string()],
        "an under-replicated chunk must be redistributed, not evicted"
    );
    assert!(cache.contains("c1").await.unwrap());
}

#[tokio::test]
async fn duplicate_confirmations_never_double_count() {
    let db = memory_pool().await;
    let peer = seed_peer(&db, 1, 100, true).await;
    ledger::create_file(&db, "f1", 9, "vault.bin", 4096, 1)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c1", 0).await;

    assert!(matches!(
        apply_stored(&db, "c1", peer).await.unwrap(),
        StoredApplied::Recorded(_)
    ));
    assert!(matches!(
        apply_stored(&db, "c1", peer).await.unwrap(),
        StoredApplied::Duplicate
    ));

    let (replicas, _) = chunk_state(&db, "c1").await;
    assert_eq!(replicas, 1, "a peer counts once per chunk");

    let contributions: i64 =
        sqlx::query_scalar("SELECT chunks_stored FROM peers WHERE id = ?")
            .bind(peer)
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(contributions, 1, "duplicates must not inflate contribution");
}

#[tokio::test]
async fn one_lost_replica_out_of_five_is_attention_not_warning() {
    let db = memory_pool().await;
    ledger::create_file(&db, "f1", 9, "vault.bin", 4096, 1)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c1", 0).await;

    let mut peers = Vec::new();
    for user in 1..=REPLICA_TARGET {
        peers.push(seed_peer(&db, user, 100, true).await);
    }
    for peer_id in &peers {
        apply_stored(&db, "c1", *peer_id).await.unwrap();
    }
    let (_, status) = chunk_state(&db, "c1").await;
    assert_eq!(status, "ok");

    let change = apply_missing(&db, "c1", peers[0])
        .await
        .unwrap()
        .expect("chunk still exists");
    assert_eq!(change.replica_count, 4);
    assert_eq!(change.current, ChunkStatus::Attention);
    assert_ne!(
        change.current,
        ChunkStatus::Warning,
        "a single loss must not yet trigger the cache-fill band"
    );
}

#[tokio::test]
async fn drain_evicts_the_cache_once_target_replication_is_met() {
    let db = memory_pool().await;
    let cache = OverflowCache::new(db.clone());
    ledger::create_file(&db, "f1", 9, "vault.bin", 4096, 1)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c1", 0).await;
    cache.put("c1", b"fallback-copy").await.unwrap();

    for user in 1..=REPLICA_TARGET {
        let peer = seed_peer(&db, user, 100, true).await;
        apply_stored(&db, "c1", peer).await.unwrap();
    }

    let outcome = cache_drain(&db, &cache).await.unwrap();
    assert_eq!(outcome.evicted, vec!["c1".to_string()]);
    assert!(outcome.redistribute.is_empty());
    assert!(
        !cache.contains("c1").await.unwrap(),
        "a healthy chunk's cache entry is redundant and must go"
    );
}

#[tokio::test]
async fn stalled_pending_chunks_are_demoted_after_the_placement_deadline() {
    let db = memory_pool().await;
    let now = 10_000;
    ledger::create_file(&db, "f1", 9, "vault.bin", 4096, 2)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c-stalled", 0).await;
    seed_chunk(&db, "f1", "c-fresh", 1).await;
    ledger::mark_placed(&db, "c-stalled", now - 300).await.unwrap();
    ledger::mark_placed(&db, "c-fresh", now - 10).await.unwrap();

    let fills = status_sweep(&db, now).await.unwrap();
    assert_eq!(fills, vec!["c-stalled".to_string()]);

    let (_, stalled_status) = chunk_state(&db, "c-stalled").await;
    let (_, fresh_status) = chunk_state(&db, "c-fresh").await;
    assert_eq!(stalled_status, "warning", "deadline lapsed: placement failed");
    assert_eq!(fresh_status, "pending", "grace period still running");
}

#[tokio::test]
async fn status_sweep_repairs_drifted_status() {
    let db = memory_pool().await;
    ledger::create_file(&db, "f1", 9, "vault.bin", 4096, 1)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c1", 0).await;
    let peer = seed_peer(&db, 1, 100, true).await;
    apply_stored(&db, "c1", peer).await.unwrap();

    // Simulate drift (e.g. a crash between recount and update).
    sqlx::query("UPDATE chunks SET status = 'ok' WHERE id = 'c1'")
        .execute(&db)
        .await
        .unwrap();

    let fills = status_sweep(&db, 10_000).await.unwrap();
    assert_eq!(fills, vec!["c1".to_string()]);
    let (_, status) = chunk_state(&db, "c1").await;
    assert_eq!(status, "warning");
}

#[tokio::test]
async fn file_completes_exactly_when_the_last_chunk_reaches_ok() {
    let db = memory_pool().await;
    ledger::create_file(&db, "f1", 9, "vault.bin", 8192, 2)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c1", 0).await;
    seed_chunk(&db, "f1", "c2", 1).await;

    let mut peers = Vec::new();
    for user in 1..=REPLICA_TARGET {
        peers.push(seed_peer(&db, user, 100, true).await);
    }

    for peer_id in &peers {
        match apply_stored(&db, "c1", *peer_id).await.unwrap() {
            StoredApplied::Recorded(outcome) => assert!(
                outcome.completed_file.is_none(),
                "file must not complete with a chunk outstanding"
            ),
            other => panic!("unexpected: {other:?}"),
        }
    }

    let mut completed = None;
    for peer_id in &peers {
        if let StoredApplied::Recorded(outcome) = apply_stored(&db, "c2", *peer_id).await.unwrap() {
            if let Some(done) = outcome.completed_file {
                completed = Some(done);
            }
        }
    }
    let done = completed.expect("last ok chunk must complete the file");
    assert_eq!(done.file_id, "f1");
    assert_eq!(done.user_id, 9);
    assert_eq!(done.file_size_bytes, 8192);

    let (status, complete): (String, i64) =
        sqlx::query_as("SELECT upload_status, chunks_complete FROM files WHERE id = 'f1'")
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(status, "complete");
    assert_eq!(complete, 2);
}

#[tokio::test]
async fn cascade_delete_scrubs_replicas_cache_and_chunks() {
    let db = memory_pool().await;
    let cache = OverflowCache::new(db.clone());
    ledger::create_file(&db, "f1", 9, "vault.bin", 8192, 2)
        .await
        .unwrap();
    seed_chunk(&db, "f1", "c1", 0).await;
    seed_chunk(&db, "f1", "c2", 1).await;
    let peer = seed_peer(&db, 1, 100, true).await;
    apply_stored(&db, "c1", peer).await.unwrap();
    cache.put("c2", b"cached").await.unwrap();

    let deletion = ledger::delete_file(&db, "f1")
        .await
        .unwrap()
        .expect("file existed");
    assert_eq!(deletion.user_id, 9);
    assert_eq!(deletion.file_size_bytes, 8192);
    assert_eq!(deletion.chunk_ids.len(), 2);

    for table in ["files", "chunks", "chunk_replicas", "cached_chunks"] {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(count, 0, "{table} must be empty after the cascade");
    }

    assert!(
        ledger::delete_file(&db, "f1").await.unwrap().is_none(),
        "second delete finds nothing"
    );
}

#[tokio::test]
async fn confirmation_for_a_deleted_chunk_leaves_no_dangling_replica() {
    let db = memory_pool().await;
    let peer = seed_peer(&db, 1, 100, true).await;

    let applied = apply_stored(&db, "ghost-chunk", peer).await.unwrap();
    assert!(matches!(applied, StoredApplied::UnknownChunk));

    let dangling: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_replicas")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(dangling, 0);
}
