//! Storage substrate: a single-writer SQLite pool shared by both stores.
//!
//! The pool is pinned to one connection so SQLite's own serialization
//! orders all reads and writes. That discipline is what makes the
//! scan-then-insert dedup predicate safe without explicit transactions.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use tracing::info;

use crate::error::Result;

pub(crate) type SqlitePool = Pool<SqliteConnectionManager>;
pub(crate) type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Schema for the persistent memory store. Idempotent.
pub(crate) const MEMORY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id              TEXT PRIMARY KEY,
    text            TEXT NOT NULL,
    embedding       BLOB,
    source          TEXT DEFAULT '',
    session_id      TEXT DEFAULT '',
    metadata        TEXT DEFAULT '{}',
    decay_level     INTEGER DEFAULT 0,
    created_at      TEXT NOT NULL,
    last_referenced TEXT NOT NULL,
    access_count    INTEGER DEFAULT 0
);
CREATE TABLE IF NOT EXISTS memory_tags (
    memory_id TEXT NOT NULL,
    tag       TEXT NOT NULL,
    PRIMARY KEY (memory_id, tag),
    FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_memory_tags_tag ON memory_tags(tag);
CREATE INDEX IF NOT EXISTS idx_memories_decay ON memories(decay_level);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_referenced ON memories(last_referenced);
";

/// Schema for the session context store. Idempotent.
pub(crate) const SESSION_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id               TEXT PRIMARY KEY,
    max_tokens       INTEGER NOT NULL,
    dedup_threshold  REAL NOT NULL DEFAULT 0.15,
    preserve_recent  INTEGER NOT NULL DEFAULT 10,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS session_entries (
    id                TEXT PRIMARY KEY,
    session_id        TEXT NOT NULL,
    role              TEXT NOT NULL DEFAULT '',
    content           TEXT NOT NULL,
    original_content  TEXT NOT NULL,
    source            TEXT DEFAULT '',
    embedding         BLOB,
    importance        REAL NOT NULL DEFAULT 0.5,
    compression_level INTEGER NOT NULL DEFAULT 0,
    tokens            INTEGER NOT NULL DEFAULT 0,
    seq               INTEGER NOT NULL,
    created_at        TEXT NOT NULL,
    compressed_at     TEXT,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_entries_session ON session_entries(session_id);
CREATE INDEX IF NOT EXISTS idx_entries_seq ON session_entries(session_id, seq);
";

/// Open a single-writer pool at `path` (`:memory:` for a transient store)
/// and run the given idempotent schema.
pub(crate) fn open_pool(path: &str, schema: &'static str) -> Result<SqlitePool> {
    let manager = if path == ":memory:" {
        SqliteConnectionManager::memory()
    } else {
        if let Some(parent) = Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        SqliteConnectionManager::file(path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
    };

    // WAL keeps readers fast if the pool is ever widened; foreign keys give
    // the cascade deletes the schemas rely on. PRAGMAs are per-connection,
    // so they run in the pool's init hook.
    let manager = manager.with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = Pool::builder().max_size(1).build(manager)?;

    {
        let conn = pool.get()?;
        conn.execute_batch(schema)?;
    }

    info!(path, "opened store");
    Ok(pool)
}

/// Format a timestamp as fixed-width RFC 3339 with microsecond precision.
/// Stored strings compare lexicographically, which the age-cutoff queries
/// depend on.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Parse a stored timestamp. Unparseable values collapse to the epoch
/// rather than failing a whole row read.
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    #[test]
    fn test_open_in_memory_and_migrate_twice() {
        let pool = open_pool(":memory:", MEMORY_SCHEMA).unwrap();
        // Idempotent: re-running the schema on the same connection is fine.
        let conn = pool.get().unwrap();
        conn.execute_batch(MEMORY_SCHEMA).unwrap();
    }

    #[test]
    fn test_single_writer_pool() {
        let pool = open_pool(":memory:", SESSION_SCHEMA).unwrap();
        assert_eq!(pool.max_size(), 1);
    }

    #[test]
    fn test_timestamp_roundtrip_and_ordering() {
        let a = Utc::now();
        let s = format_ts(a);
        assert_eq!(parse_ts(&s), a.trunc_subsecs(6));

        let later = format_ts(a + chrono::Duration::microseconds(1));
        assert!(later > s);
    }

    #[test]
    fn test_parse_bad_timestamp_is_epoch() {
        assert_eq!(parse_ts("not a time"), DateTime::<Utc>::UNIX_EPOCH);
    }
}
