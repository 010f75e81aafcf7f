//! Integration tests for the persistent memory store and decay worker.

use std::f64::consts::{FRAC_PI_2, PI};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use context_core::config::MemoryConfig;
use context_core::memory::{
    DecayWorker, ForgetRequest, MemoryStore, RecallRequest, SqliteMemoryStore, StoreEntry,
    StoreRequest,
};
use context_core::testing::embedding_at_angle;
use context_core::Error;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fixtures and helpers
// =============================================================================

fn new_test_store() -> SqliteMemoryStore {
    SqliteMemoryStore::open(":memory:", MemoryConfig::default()).unwrap()
}

fn entry(text: &str) -> StoreEntry {
    StoreEntry {
        text: text.to_string(),
        ..Default::default()
    }
}

fn entry_with(text: &str, angle: f64, source: &str, tags: &[&str]) -> StoreEntry {
    StoreEntry {
        text: text.to_string(),
        embedding: embedding_at_angle(angle, 8),
        source: source.to_string(),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

fn store_all(store: &SqliteMemoryStore, entries: Vec<StoreEntry>) {
    store
        .store(
            StoreRequest {
                session_id: String::new(),
                entries,
            },
            &CancellationToken::new(),
        )
        .unwrap();
}

/// Rewrite last_referenced on every row through a second connection, the
/// way a long-idle store would look.
fn backdate_all(path: &Path, hours: i64) {
    let conn = Connection::open(path).unwrap();
    let past = (Utc::now() - chrono::Duration::hours(hours))
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    conn.execute("UPDATE memories SET last_referenced = ?1", [past])
        .unwrap();
}

const LONG_TEXT: &str = "The authentication service uses JWT tokens with RS256 signing. \
    It validates tokens on every request. The token expiry is set to 24 hours. \
    Refresh tokens are stored in Redis with a 7-day TTL. \
    The service also supports OAuth2 for third-party integrations.";

// =============================================================================
// Store and recall
// =============================================================================

#[test]
fn test_store_and_recall_ordering() {
    let store = new_test_store();
    store_all(
        &store,
        vec![
            entry_with("The auth service uses JWT with RS256", 0.0, "code_review", &["auth"]),
            entry_with("The payment service uses Stripe API", FRAC_PI_2, "docs", &["payments"]),
        ],
    );

    let recall = store
        .recall(
            RecallRequest {
                query: "How does authentication work?".to_string(),
                query_embedding: embedding_at_angle(0.05, 8),
                max_results: 5,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(!recall.memories.is_empty());
    // The near-angle entry must rank first.
    assert_eq!(recall.memories[0].source, "code_review");
    assert_eq!(recall.stats.candidates, 2);
}

#[test]
fn test_write_time_dedup() {
    let store = new_test_store();
    let cancel = CancellationToken::new();
    let emb = embedding_at_angle(0.0, 8);

    let r1 = store
        .store(
            StoreRequest {
                entries: vec![StoreEntry {
                    text: "JWT uses RS256 for signing".to_string(),
                    embedding: emb.clone(),
                    source: "docs".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();
    assert_eq!(r1.stored, 1);
    assert_eq!(r1.deduplicated, 0);
    assert_eq!(r1.total_memories, 1);

    let r2 = store
        .store(
            StoreRequest {
                entries: vec![StoreEntry {
                    text: "Auth tokens are signed with RS256".to_string(),
                    embedding: emb,
                    source: "code".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();
    assert_eq!(r2.stored, 0);
    assert_eq!(r2.deduplicated, 1);
    assert_eq!(r2.total_memories, 1);

    let stats = store.stats(&cancel).unwrap();
    assert_eq!(stats.total_memories, 1);
    assert_eq!(stats.by_decay_level.get(&0), Some(&1));
}

#[test]
fn test_dedup_touches_surviving_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let store = SqliteMemoryStore::open(path.to_str().unwrap(), MemoryConfig::default()).unwrap();
    let cancel = CancellationToken::new();
    let emb = embedding_at_angle(0.0, 8);

    store
        .store(
            StoreRequest {
                entries: vec![StoreEntry {
                    text: "first write".to_string(),
                    embedding: emb.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();

    let read_ref = || -> String {
        let conn = Connection::open(&path).unwrap();
        conn.query_row("SELECT last_referenced FROM memories", [], |row| row.get(0))
            .unwrap()
    };
    let before = read_ref();

    std::thread::sleep(Duration::from_millis(5));
    store
        .store(
            StoreRequest {
                entries: vec![StoreEntry {
                    text: "near duplicate".to_string(),
                    embedding: emb,
                    ..Default::default()
                }],
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();

    let after = read_ref();
    assert!(after > before, "dedup merge must touch last_referenced");

    let count: i64 = {
        let conn = Connection::open(&path).unwrap();
        conn.query_row("SELECT access_count FROM memories", [], |row| row.get(0))
            .unwrap()
    };
    assert_eq!(count, 1);
}

#[test]
fn test_recall_tag_filter() {
    let store = new_test_store();
    store_all(
        &store,
        vec![
            entry_with("Auth uses JWT", 0.0, "", &["auth"]),
            entry_with("Payments use Stripe", FRAC_PI_2, "", &["payments"]),
            entry_with("Auth also uses OAuth", PI, "", &["auth"]),
        ],
    );

    let recall = store
        .recall(
            RecallRequest {
                query: "how does it work".to_string(),
                query_embedding: embedding_at_angle(0.0, 8),
                tags: vec!["auth".to_string()],
                max_results: 10,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(recall.memories.len(), 2);
    for memory in &recall.memories {
        assert!(memory.tags.contains(&"auth".to_string()));
    }
}

#[test]
fn test_recall_token_budget() {
    let store = new_test_store();
    store_all(
        &store,
        vec![
            entry_with("Short entry about auth", 0.0, "", &[]),
            entry_with(
                "This is a much longer entry about authentication that contains many more \
                 tokens and details about how the JWT system works with RS256 signing",
                0.1,
                "",
                &[],
            ),
            entry_with("Another auth entry", 0.2, "", &[]),
        ],
    );

    let recall = store
        .recall(
            RecallRequest {
                query: "auth".to_string(),
                query_embedding: embedding_at_angle(0.0, 8),
                max_tokens: 20,
                max_results: 10,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(recall.stats.token_count <= 20);
    assert!(recall.stats.returned < recall.stats.candidates);
    assert_eq!(
        recall.stats.deduplicated,
        recall.stats.candidates - recall.stats.returned
    );
}

#[test]
fn test_recall_recency_weighting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let store = SqliteMemoryStore::open(path.to_str().unwrap(), MemoryConfig::default()).unwrap();

    // Old entry aligned with the query, then everything backdated, then a
    // fresh entry pointing away from the query.
    store_all(&store, vec![entry_with("old aligned entry", 0.0, "", &[])]);
    backdate_all(&path, 48);
    store_all(&store, vec![entry_with("fresh orthogonal entry", FRAC_PI_2, "", &[])]);

    let recall = store
        .recall(
            RecallRequest {
                query_embedding: embedding_at_angle(0.0, 8),
                recency_weight: 1.0,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();

    // With recency_weight = 1.0, ordering follows last_referenced only.
    assert_eq!(recall.memories[0].text, "fresh orthogonal entry");
    assert!(recall.memories[0].last_referenced >= recall.memories[1].last_referenced);
}

#[test]
fn test_recall_requires_query_or_embedding() {
    let store = new_test_store();
    let err = store
        .recall(RecallRequest::default(), &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidQuery));
}

#[test]
fn test_store_empty_text_skipped() {
    let store = new_test_store();
    let result = store
        .store(
            StoreRequest {
                entries: vec![entry(""), entry("Valid entry")],
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();
    assert_eq!(result.stored, 1);
}

// =============================================================================
// Forget
// =============================================================================

#[test]
fn test_forget_by_tag() {
    let store = new_test_store();
    store_all(
        &store,
        vec![
            entry_with("Old deprecated info", 0.0, "", &["deprecated"]),
            entry_with("Current auth info", 1.0, "", &["auth"]),
            entry_with("Another deprecated item", 2.0, "", &["deprecated"]),
        ],
    );

    let result = store
        .forget(
            ForgetRequest {
                tags: vec!["deprecated".to_string()],
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.removed, 2);
    assert_eq!(result.total_memories, 1);
}

#[test]
fn test_forget_by_age() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let store = SqliteMemoryStore::open(path.to_str().unwrap(), MemoryConfig::default()).unwrap();

    store_all(&store, vec![entry("Old memory")]);
    // Backdate created_at directly; Forget filters on creation time.
    {
        let conn = Connection::open(&path).unwrap();
        let past = (Utc::now() - chrono::Duration::hours(48))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute("UPDATE memories SET created_at = ?1", [past]).unwrap();
    }
    store_all(&store, vec![entry("Recent memory")]);

    let result = store
        .forget(
            ForgetRequest {
                older_than: Some(Utc::now() - chrono::Duration::hours(24)),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(result.removed, 1);
    assert_eq!(result.total_memories, 1);
}

#[test]
fn test_forget_without_filters_is_noop() {
    let store = new_test_store();
    store_all(&store, vec![entry("keep me")]);

    let result = store
        .forget(ForgetRequest::default(), &CancellationToken::new())
        .unwrap();

    assert_eq!(result.removed, 0);
    assert_eq!(result.total_memories, 1);
}

// =============================================================================
// Stats
// =============================================================================

#[test]
fn test_stats_histograms() {
    let store = new_test_store();
    store_all(
        &store,
        vec![
            entry_with("Entry from code review", 0.0, "code_review", &[]),
            entry_with("Entry from docs", 1.0, "docs", &[]),
            entry_with("Another code review entry", 2.0, "code_review", &[]),
        ],
    );

    let stats = store.stats(&CancellationToken::new()).unwrap();
    assert_eq!(stats.total_memories, 3);
    assert_eq!(stats.by_source.get("code_review"), Some(&2));
    assert_eq!(stats.by_source.get("docs"), Some(&1));
    assert_eq!(stats.by_decay_level.get(&0), Some(&3));
    assert!(stats.oldest_memory.is_some());
    assert!(stats.newest_memory.is_some());
}

#[test]
fn test_stats_empty_store() {
    let store = new_test_store();
    let stats = store.stats(&CancellationToken::new()).unwrap();
    assert_eq!(stats.total_memories, 0);
    assert!(stats.by_decay_level.is_empty());
}

// =============================================================================
// Decay
// =============================================================================

fn fast_decay_config() -> MemoryConfig {
    MemoryConfig {
        summary_age: Duration::from_millis(1),
        keywords_age: Duration::from_millis(1),
        evict_age: Duration::ZERO,
        ..Default::default()
    }
}

#[test]
fn test_decay_progression_one_level_per_pass() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let cfg = fast_decay_config();
    let store = Arc::new(SqliteMemoryStore::open(path.to_str().unwrap(), cfg.clone()).unwrap());
    let cancel = CancellationToken::new();

    store
        .store(
            StoreRequest {
                entries: vec![entry(LONG_TEXT)],
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();
    backdate_all(&path, 48);

    let worker = DecayWorker::new(Arc::clone(&store), cfg);

    let stats1 = worker.run_once().unwrap();
    assert_eq!(stats1.to_summary, 1);
    let s = store.stats(&cancel).unwrap();
    assert_eq!(s.by_decay_level.get(&1), Some(&1));

    let stats2 = worker.run_once().unwrap();
    assert_eq!(stats2.to_keywords, 1);
    let s = store.stats(&cancel).unwrap();
    assert_eq!(s.by_decay_level.get(&2), Some(&1));
}

#[test]
fn test_decay_evicts_terminal_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let cfg = MemoryConfig {
        evict_age: Duration::from_millis(1),
        summary_age: Duration::ZERO,
        keywords_age: Duration::ZERO,
        ..Default::default()
    };
    let store = Arc::new(SqliteMemoryStore::open(path.to_str().unwrap(), cfg.clone()).unwrap());

    store
        .store(
            StoreRequest {
                entries: vec![entry("stale keywords row")],
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE memories SET decay_level = 2", []).unwrap();
    }
    backdate_all(&path, 48);

    let worker = DecayWorker::new(Arc::clone(&store), cfg);
    let stats = worker.run_once().unwrap();
    assert_eq!(stats.evicted, 1);

    let s = store.stats(&CancellationToken::new()).unwrap();
    assert_eq!(s.total_memories, 0);
}

#[test]
fn test_recall_resets_decay_clock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let cfg = MemoryConfig {
        summary_age: Duration::from_secs(3600),
        keywords_age: Duration::from_secs(3600),
        evict_age: Duration::ZERO,
        ..Default::default()
    };
    let store = Arc::new(SqliteMemoryStore::open(path.to_str().unwrap(), cfg.clone()).unwrap());
    let cancel = CancellationToken::new();

    store
        .store(
            StoreRequest {
                entries: vec![StoreEntry {
                    text: LONG_TEXT.to_string(),
                    embedding: embedding_at_angle(0.0, 8),
                    ..Default::default()
                }],
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();
    backdate_all(&path, 48);

    // Recall touches the row, pulling last_referenced back inside the
    // decay cutoff window.
    store
        .recall(
            RecallRequest {
                query_embedding: embedding_at_angle(0.0, 8),
                ..Default::default()
            },
            &cancel,
        )
        .unwrap();

    let worker = DecayWorker::new(Arc::clone(&store), cfg);
    let stats = worker.run_once().unwrap();
    assert_eq!(stats.to_summary, 0);

    let s = store.stats(&cancel).unwrap();
    assert_eq!(s.by_decay_level.get(&0), Some(&1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_decay_worker_start_stop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");
    let cfg = MemoryConfig {
        decay_interval: Duration::from_millis(10),
        ..fast_decay_config()
    };
    let store = Arc::new(SqliteMemoryStore::open(path.to_str().unwrap(), cfg.clone()).unwrap());

    store
        .store(
            StoreRequest {
                entries: vec![entry(LONG_TEXT)],
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap();
    backdate_all(&path, 48);

    let worker = DecayWorker::new(Arc::clone(&store), cfg);
    let handle = worker.start();

    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.stop();
    handle.await.unwrap();

    let stats = store.stats(&CancellationToken::new()).unwrap();
    let advanced = stats.by_decay_level.get(&1).copied().unwrap_or(0)
        + stats.by_decay_level.get(&2).copied().unwrap_or(0);
    assert!(advanced >= 1, "worker should have run at least one pass");
}

// =============================================================================
// Lifecycle and cancellation
// =============================================================================

#[test]
fn test_closed_store_rejects_operations() {
    let store = new_test_store();
    store.close().unwrap();

    let err = store
        .store(
            StoreRequest {
                entries: vec![entry("late write")],
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(err, Error::StoreClosed));

    let err = store.stats(&CancellationToken::new()).unwrap_err();
    assert!(matches!(err, Error::StoreClosed));
}

#[test]
fn test_cancelled_token_surfaces() {
    let store = new_test_store();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = store
        .store(
            StoreRequest {
                entries: vec![entry("never stored")],
                ..Default::default()
            },
            &cancel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let err = store
        .recall(
            RecallRequest {
                query: "anything".to_string(),
                ..Default::default()
            },
            &cancel,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}
