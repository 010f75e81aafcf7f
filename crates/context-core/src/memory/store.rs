//! SQLite-backed memory store.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rusqlite::params;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::MemoryConfig;
use crate::db::{self, PooledConn, SqlitePool};
use crate::error::{Error, Result};
use crate::ident::generate_id;
use crate::tokens::estimate_tokens;
use crate::vector::{cosine_distance, decode_embedding, encode_embedding};

use super::{
    DecayLevel, ForgetRequest, ForgetResult, MemoryStats, MemoryStore, RecallRequest,
    RecallResult, RecallStats, RecalledMemory, StoreRequest, StoreResult,
};

/// Memory store over a single-writer SQLite pool. All operations are
/// serialized by the substrate; no application-level lock is held.
pub struct SqliteMemoryStore {
    pool: SqlitePool,
    cfg: MemoryConfig,
    closed: AtomicBool,
}

impl SqliteMemoryStore {
    /// Open (and migrate) a store at `path`; `:memory:` selects a
    /// transient instance.
    pub fn open(path: &str, cfg: MemoryConfig) -> Result<Self> {
        let pool = db::open_pool(path, db::MEMORY_SCHEMA)?;
        Ok(Self {
            pool,
            cfg,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.cfg
    }

    pub(crate) fn conn(&self) -> Result<PooledConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(self.pool.get()?)
    }

    /// Scan existing embeddings for one within the dedup threshold.
    ///
    /// Linear over all rows, which is fine below ~10K memories; an ANN
    /// index could replace this scan without changing the contract.
    fn find_duplicate(conn: &PooledConn, embedding: &[f32], threshold: f64) -> Result<Option<String>> {
        let mut stmt =
            conn.prepare("SELECT id, embedding FROM memories WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        for row in rows {
            let (id, blob) = row?;
            let existing = decode_embedding(&blob);
            if existing.is_empty() {
                continue;
            }
            if cosine_distance(embedding, &existing) < threshold {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn count_memories(conn: &PooledConn) -> Result<usize> {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn load_tags(conn: &PooledConn, memory_id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT tag FROM memory_tags WHERE memory_id = ?1")?;
        let rows = stmt.query_map([memory_id], |row| row.get::<_, String>(0))?;
        let mut tags = Vec::new();
        for tag in rows {
            tags.push(tag?);
        }
        Ok(tags)
    }

    /// Touch: reset the decay clock and bump the access count for the
    /// given ids in a single statement.
    fn touch_memories(conn: &PooledConn, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = db::now_ts();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "UPDATE memories SET last_referenced = ?, access_count = access_count + 1
             WHERE id IN ({placeholders})"
        );
        let mut args: Vec<&dyn rusqlite::ToSql> = vec![&now];
        for id in ids {
            args.push(id);
        }
        conn.execute(&sql, rusqlite::params_from_iter(args))?;
        Ok(())
    }
}

impl MemoryStore for SqliteMemoryStore {
    fn store(&self, req: StoreRequest, cancel: &CancellationToken) -> Result<StoreResult> {
        let conn = self.conn()?;
        let mut result = StoreResult::default();

        for entry in &req.entries {
            if entry.text.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Write-time dedup: a semantically identical entry refreshes
            // the existing row instead of inserting a second one.
            if !entry.embedding.is_empty() {
                if let Some(dup_id) =
                    Self::find_duplicate(&conn, &entry.embedding, self.cfg.dedup_threshold)?
                {
                    conn.execute(
                        "UPDATE memories SET last_referenced = ?1, access_count = access_count + 1
                         WHERE id = ?2",
                        params![db::now_ts(), dup_id],
                    )?;
                    result.deduplicated += 1;
                    continue;
                }
            }

            let id = generate_id();
            let now = db::now_ts();
            let metadata = serde_json::to_string(&entry.metadata)?;
            let blob = if entry.embedding.is_empty() {
                None
            } else {
                Some(encode_embedding(&entry.embedding))
            };

            conn.execute(
                "INSERT INTO memories
                 (id, text, embedding, source, session_id, metadata, decay_level,
                  created_at, last_referenced, access_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, 0)",
                params![id, entry.text, blob, entry.source, req.session_id, metadata, now, now],
            )?;

            for tag in &entry.tags {
                conn.execute(
                    "INSERT OR IGNORE INTO memory_tags (memory_id, tag) VALUES (?1, ?2)",
                    params![id, tag],
                )?;
            }

            result.stored += 1;
        }

        result.total_memories = Self::count_memories(&conn)?;
        debug!(
            stored = result.stored,
            deduplicated = result.deduplicated,
            "store pass complete"
        );
        Ok(result)
    }

    fn recall(&self, req: RecallRequest, cancel: &CancellationToken) -> Result<RecallResult> {
        if req.query.is_empty() && req.query_embedding.is_empty() {
            return Err(Error::InvalidQuery);
        }

        let max_results = if req.max_results == 0 { 10 } else { req.max_results };
        let recency_weight = req.recency_weight.clamp(0.0, 1.0);

        let conn = self.conn()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut sql = String::from(
            "SELECT m.id, m.text, m.embedding, m.source, m.decay_level, m.last_referenced
             FROM memories m",
        );
        if !req.tags.is_empty() {
            let placeholders = vec!["?"; req.tags.len()].join(",");
            sql.push_str(&format!(
                " WHERE m.id IN (SELECT memory_id FROM memory_tags WHERE tag IN ({placeholders}))"
            ));
        }

        struct RawRow {
            id: String,
            text: String,
            embedding: Option<Vec<u8>>,
            source: String,
            decay_level: i64,
            last_referenced: String,
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(req.tags.iter()), |row| {
            Ok(RawRow {
                id: row.get(0)?,
                text: row.get(1)?,
                embedding: row.get(2)?,
                source: row.get(3)?,
                decay_level: row.get(4)?,
                last_referenced: row.get(5)?,
            })
        })?;
        let raw: Vec<RawRow> = rows.collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let now = Utc::now();
        let mut candidates = Vec::with_capacity(raw.len());
        for r in raw {
            let tags = Self::load_tags(&conn, &r.id)?;
            let last_referenced = db::parse_ts(&r.last_referenced);

            let mut similarity = 0.0;
            if !req.query_embedding.is_empty() {
                if let Some(blob) = &r.embedding {
                    let existing = decode_embedding(blob);
                    if !existing.is_empty() {
                        similarity = 1.0 - cosine_distance(&req.query_embedding, &existing);
                    }
                }
            }

            // Recency decays with a 24-hour half-time on last reference.
            let age_hours = (now - last_referenced).num_seconds().max(0) as f64 / 3600.0;
            let recency = 1.0 / (1.0 + age_hours / 24.0);

            let relevance = (1.0 - recency_weight) * similarity + recency_weight * recency;

            candidates.push(RecalledMemory {
                id: r.id,
                text: r.text,
                source: r.source,
                tags,
                relevance,
                decay_level: DecayLevel::from_i64(r.decay_level),
                last_referenced,
            });
        }

        // Stable sort: ties keep insertion order.
        candidates.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total_candidates = candidates.len();
        let mut memories = Vec::new();
        let mut token_count = 0usize;
        for candidate in candidates {
            if memories.len() >= max_results {
                break;
            }
            let tokens = estimate_tokens(&candidate.text);
            if req.max_tokens > 0 && token_count + tokens > req.max_tokens {
                break;
            }
            token_count += tokens;
            memories.push(candidate);
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
        Self::touch_memories(&conn, &ids)?;

        let returned = memories.len();
        Ok(RecallResult {
            memories,
            stats: RecallStats {
                candidates: total_candidates,
                deduplicated: total_candidates - returned,
                returned,
                token_count,
            },
        })
    }

    fn forget(&self, req: ForgetRequest, cancel: &CancellationToken) -> Result<ForgetResult> {
        let conn = self.conn()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut conditions = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if !req.ids.is_empty() {
            let placeholders = vec!["?"; req.ids.len()].join(",");
            conditions.push(format!("id IN ({placeholders})"));
            args.extend(req.ids.iter().cloned());
        }
        if !req.tags.is_empty() {
            let placeholders = vec!["?"; req.tags.len()].join(",");
            conditions.push(format!(
                "id IN (SELECT memory_id FROM memory_tags WHERE tag IN ({placeholders}))"
            ));
            args.extend(req.tags.iter().cloned());
        }
        if let Some(cutoff) = req.older_than {
            conditions.push("created_at < ?".to_string());
            args.push(db::format_ts(cutoff));
        }

        // No filters means no-op, never a full wipe.
        if conditions.is_empty() {
            return Ok(ForgetResult {
                removed: 0,
                total_memories: Self::count_memories(&conn)?,
            });
        }

        let sql = format!("DELETE FROM memories WHERE {}", conditions.join(" AND "));
        let removed = conn.execute(&sql, rusqlite::params_from_iter(args.iter()))?;

        Ok(ForgetResult {
            removed,
            total_memories: Self::count_memories(&conn)?,
        })
    }

    fn stats(&self, cancel: &CancellationToken) -> Result<MemoryStats> {
        let conn = self.conn()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut stats = MemoryStats {
            total_memories: Self::count_memories(&conn)?,
            ..Default::default()
        };

        {
            let mut stmt =
                conn.prepare("SELECT decay_level, COUNT(*) FROM memories GROUP BY decay_level")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (level, count) = row?;
                stats.by_decay_level.insert(level, count);
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT source, COUNT(*) FROM memories WHERE source != '' GROUP BY source",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (source, count) = row?;
                stats.by_source.insert(source, count);
            }
        }

        let oldest: Option<String> =
            conn.query_row("SELECT MIN(created_at) FROM memories", [], |row| row.get(0))?;
        let newest: Option<String> =
            conn.query_row("SELECT MAX(created_at) FROM memories", [], |row| row.get(0))?;
        stats.oldest_memory = oldest.map(|s| db::parse_ts(&s));
        stats.newest_memory = newest.map(|s| db::parse_ts(&s));

        Ok(stats)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
        Ok(())
    }
}

impl Drop for SqliteMemoryStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
