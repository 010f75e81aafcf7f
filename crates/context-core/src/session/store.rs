//! SQLite-backed session store.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::compress::{compress_to_level, CompressionLevel};
use crate::config::SessionConfig;
use crate::db::{self, PooledConn, SqlitePool};
use crate::error::{Error, Result};
use crate::ident::generate_id;
use crate::tokens::estimate_tokens;
use crate::vector::{cosine_distance, decode_embedding, encode_embedding};

use super::{
    ContextEntry, ContextRequest, ContextResult, ContextStats, CreateRequest, DeleteResult,
    PushRequest, PushResult, Session, SessionStore,
};

/// Session store over a single-writer SQLite pool.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    cfg: SessionConfig,
    closed: AtomicBool,
}

/// Per-session enforcement parameters, loaded once per push.
struct SessionParams {
    max_tokens: usize,
    dedup_threshold: f64,
    preserve_recent: usize,
}

/// An entry eligible for compression or eviction.
struct Candidate {
    id: String,
    original_content: String,
    level: CompressionLevel,
    importance: f64,
    tokens: usize,
}

impl SqliteSessionStore {
    /// Open (and migrate) a store at `path`; `:memory:` selects a
    /// transient instance.
    pub fn open(path: &str, cfg: SessionConfig) -> Result<Self> {
        let pool = db::open_pool(path, db::SESSION_SCHEMA)?;
        Ok(Self {
            pool,
            cfg,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    fn conn(&self) -> Result<PooledConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StoreClosed);
        }
        Ok(self.pool.get()?)
    }

    fn load_params(conn: &PooledConn, session_id: &str) -> Result<SessionParams> {
        let row = conn
            .query_row(
                "SELECT max_tokens, dedup_threshold, preserve_recent FROM sessions WHERE id = ?1",
                [session_id],
                |row| {
                    Ok(SessionParams {
                        max_tokens: row.get::<_, i64>(0)? as usize,
                        dedup_threshold: row.get(1)?,
                        preserve_recent: row.get::<_, i64>(2)? as usize,
                    })
                },
            )
            .optional()?;
        row.ok_or(Error::NotFound)
    }

    /// Linear scan over the session's embeddings for one within threshold.
    /// Fine for typical windows (< 1K entries).
    fn is_duplicate(
        conn: &PooledConn,
        session_id: &str,
        embedding: &[f32],
        threshold: f64,
    ) -> Result<bool> {
        let mut stmt = conn.prepare(
            "SELECT embedding FROM session_entries
             WHERE session_id = ?1 AND embedding IS NOT NULL",
        )?;
        let rows = stmt.query_map([session_id], |row| row.get::<_, Vec<u8>>(0))?;
        let blobs: Vec<Vec<u8>> = rows.collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        for blob in blobs {
            let existing = decode_embedding(&blob);
            if existing.is_empty() {
                continue;
            }
            if cosine_distance(embedding, &existing) < threshold {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn sum_tokens(conn: &PooledConn, session_id: &str) -> Result<usize> {
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(tokens), 0) FROM session_entries WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(sum as usize)
    }

    fn count_entries(conn: &PooledConn, session_id: &str) -> Result<usize> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM session_entries WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// One enforcement step: compress or evict until within budget, over
    /// candidates outside the preserve-recent tail, least important first.
    /// Returns (compressed, evicted); (0, 0) signals the fixpoint.
    fn enforce_once(
        conn: &PooledConn,
        session_id: &str,
        params: &SessionParams,
    ) -> Result<(usize, usize)> {
        let mut current = Self::sum_tokens(conn, session_id)?;
        if current <= params.max_tokens {
            return Ok((0, 0));
        }

        let total = Self::count_entries(conn, session_id)?;
        let limit = total.saturating_sub(params.preserve_recent);
        if limit == 0 {
            // Everything is inside the preserve-recent tail but the window
            // is still over budget: fall back to evicting oldest-first.
            let evicted = Self::evict_oldest(conn, session_id, params.max_tokens, current)?;
            return Ok((0, evicted));
        }

        let mut stmt = conn.prepare(
            "SELECT id, original_content, compression_level, importance, tokens
             FROM session_entries WHERE session_id = ?1
             ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            Ok(Candidate {
                id: row.get(0)?,
                original_content: row.get(1)?,
                level: CompressionLevel::from_i64(row.get(2)?),
                importance: row.get(3)?,
                tokens: row.get::<_, i64>(4)? as usize,
            })
        })?;
        let mut candidates: Vec<Candidate> = rows.collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        // Least important first; the stable sort keeps seq order on ties,
        // so older entries lose first.
        candidates.sort_by(|a, b| {
            a.importance
                .partial_cmp(&b.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut compressed = 0;
        let mut evicted = 0;

        for candidate in candidates {
            if current <= params.max_tokens {
                break;
            }

            match candidate.level.next() {
                None => {
                    // Already at keywords: evict.
                    conn.execute(
                        "DELETE FROM session_entries WHERE id = ?1",
                        [&candidate.id],
                    )?;
                    current -= candidate.tokens;
                    evicted += 1;
                }
                Some(next) => {
                    // Recompress from the immutable original, never from
                    // the previously-compressed form.
                    let new_content = compress_to_level(&candidate.original_content, next);
                    let new_tokens = estimate_tokens(&new_content);
                    conn.execute(
                        "UPDATE session_entries
                         SET content = ?1, compression_level = ?2, tokens = ?3, compressed_at = ?4
                         WHERE id = ?5",
                        params![
                            new_content,
                            next.as_i64(),
                            new_tokens as i64,
                            db::now_ts(),
                            candidate.id
                        ],
                    )?;
                    current = current + new_tokens - candidate.tokens;
                    compressed += 1;
                }
            }
        }

        Ok((compressed, evicted))
    }

    /// Last resort when the preserve-recent tail alone exceeds the budget:
    /// drop the oldest entries until the window fits.
    fn evict_oldest(
        conn: &PooledConn,
        session_id: &str,
        max_tokens: usize,
        mut current: usize,
    ) -> Result<usize> {
        let mut evicted = 0;
        while current > max_tokens {
            let oldest = conn
                .query_row(
                    "SELECT id, tokens FROM session_entries
                     WHERE session_id = ?1 ORDER BY seq ASC LIMIT 1",
                    [session_id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)),
                )
                .optional()?;
            let Some((id, tokens)) = oldest else { break };
            conn.execute("DELETE FROM session_entries WHERE id = ?1", [&id])?;
            current -= tokens;
            evicted += 1;
        }
        Ok(evicted)
    }
}

impl SessionStore for SqliteSessionStore {
    fn create(&self, req: CreateRequest, cancel: &CancellationToken) -> Result<Session> {
        let conn = self.conn()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let id = if req.session_id.is_empty() {
            generate_id()
        } else {
            req.session_id
        };
        let max_tokens = if req.max_tokens == 0 {
            self.cfg.default_max_tokens
        } else {
            req.max_tokens
        };
        let dedup_threshold = if req.dedup_threshold <= 0.0 {
            self.cfg.default_dedup_threshold
        } else {
            req.dedup_threshold
        };
        let preserve_recent = if req.preserve_recent == 0 {
            self.cfg.default_preserve_recent
        } else {
            req.preserve_recent
        };

        let now = Utc::now();
        let now_str = db::format_ts(now);

        let inserted = conn.execute(
            "INSERT INTO sessions (id, max_tokens, dedup_threshold, preserve_recent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, max_tokens as i64, dedup_threshold, preserve_recent as i64, now_str, now_str],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(Error::SessionExists);
            }
            Err(e) => return Err(e.into()),
        }

        debug!(session_id = %id, max_tokens, "created session");
        Ok(Session {
            id,
            max_tokens,
            dedup_threshold,
            preserve_recent,
            current_tokens: 0,
            entry_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    fn push(&self, req: PushRequest, cancel: &CancellationToken) -> Result<PushResult> {
        let conn = self.conn()?;
        let session = Self::load_params(&conn, &req.session_id)?;

        let mut result = PushResult {
            session_id: req.session_id.clone(),
            ..Default::default()
        };

        let mut max_seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM session_entries WHERE session_id = ?1",
            [&req.session_id],
            |row| row.get(0),
        )?;

        for entry in &req.entries {
            if entry.content.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let importance = if entry.importance <= 0.0 { 0.5 } else { entry.importance };

            if !entry.embedding.is_empty()
                && Self::is_duplicate(&conn, &req.session_id, &entry.embedding, session.dedup_threshold)?
            {
                result.deduplicated += 1;
                continue;
            }

            let tokens = estimate_tokens(&entry.content);

            // A single entry that can never fit rejects the whole request.
            if tokens > session.max_tokens {
                return Err(Error::OverBudget);
            }

            max_seq += 1;
            let blob = if entry.embedding.is_empty() {
                None
            } else {
                Some(encode_embedding(&entry.embedding))
            };
            conn.execute(
                "INSERT INTO session_entries
                 (id, session_id, role, content, original_content, source, embedding,
                  importance, compression_level, tokens, seq, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11)",
                params![
                    generate_id(),
                    req.session_id,
                    entry.role,
                    entry.content,
                    entry.content,
                    entry.source,
                    blob,
                    importance,
                    tokens as i64,
                    max_seq,
                    db::now_ts()
                ],
            )?;

            result.accepted += 1;
        }

        // Enforce the budget to a fixpoint: stop when a step makes no
        // progress (nothing compressed, nothing evicted).
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (compressed, evicted) = Self::enforce_once(&conn, &req.session_id, &session)?;
            result.compressed += compressed;
            result.evicted += evicted;
            if compressed == 0 && evicted == 0 {
                break;
            }
        }

        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            params![db::now_ts(), req.session_id],
        )?;

        let current = Self::sum_tokens(&conn, &req.session_id)?;
        result.current_tokens = current;
        result.budget_remaining = session.max_tokens as i64 - current as i64;

        debug!(
            session_id = %req.session_id,
            accepted = result.accepted,
            compressed = result.compressed,
            evicted = result.evicted,
            current_tokens = result.current_tokens,
            "push complete"
        );
        Ok(result)
    }

    fn context(&self, req: ContextRequest, cancel: &CancellationToken) -> Result<ContextResult> {
        let conn = self.conn()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            [&req.session_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(Error::NotFound);
        }

        let mut sql = String::from(
            "SELECT id, role, content, source, compression_level, tokens, created_at
             FROM session_entries WHERE session_id = ?1",
        );
        let mut args: Vec<&str> = vec![&req.session_id];
        if !req.role.is_empty() {
            sql.push_str(" AND role = ?2");
            args.push(&req.role);
        }
        sql.push_str(" ORDER BY seq ASC");

        struct RawEntry {
            id: String,
            role: String,
            content: String,
            source: String,
            level: i64,
            tokens: i64,
            created_at: String,
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok(RawEntry {
                id: row.get(0)?,
                role: row.get(1)?,
                content: row.get(2)?,
                source: row.get(3)?,
                level: row.get(4)?,
                tokens: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        let raw: Vec<RawEntry> = rows.collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let now = Utc::now();
        let mut entries = Vec::new();
        let mut levels = std::collections::HashMap::new();
        let mut token_count = 0usize;

        for r in raw {
            let tokens = r.tokens as usize;
            if req.max_tokens > 0 && token_count + tokens > req.max_tokens {
                break;
            }
            let age = super::format_age(now - db::parse_ts(&r.created_at));
            entries.push(ContextEntry {
                id: r.id,
                role: r.role,
                content: r.content,
                source: r.source,
                level: CompressionLevel::from_i64(r.level),
                tokens,
                age,
            });
            token_count += tokens;
            *levels.entry(r.level).or_insert(0) += 1;
        }

        // Aggregate shrinkage over the whole session, independent of the
        // role filter and token limit applied above.
        let (original_tokens, current_tokens): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM((LENGTH(original_content) + 3) / 4), 0),
                    COALESCE(SUM(tokens), 0)
             FROM session_entries WHERE session_id = ?1",
            [&req.session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(ContextResult {
            stats: ContextStats {
                total_entries: entries.len(),
                total_tokens: token_count,
                compression_levels: levels,
                compression_savings: original_tokens - current_tokens,
            },
            entries,
        })
    }

    fn get(&self, session_id: &str, cancel: &CancellationToken) -> Result<Session> {
        let conn = self.conn()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let row = conn
            .query_row(
                "SELECT id, max_tokens, dedup_threshold, preserve_recent, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                [session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, max_tokens, dedup_threshold, preserve_recent, created, updated)) = row else {
            return Err(Error::NotFound);
        };

        let (current_tokens, entry_count): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(tokens), 0), COUNT(*) FROM session_entries WHERE session_id = ?1",
            [session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(Session {
            id,
            max_tokens: max_tokens as usize,
            dedup_threshold,
            preserve_recent: preserve_recent as usize,
            current_tokens: current_tokens as usize,
            entry_count: entry_count as usize,
            created_at: db::parse_ts(&created),
            updated_at: db::parse_ts(&updated),
        })
    }

    fn delete(&self, session_id: &str, cancel: &CancellationToken) -> Result<DeleteResult> {
        let conn = self.conn()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let entries_removed = Self::count_entries(&conn, session_id)?;

        let affected = conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        if affected == 0 {
            return Err(Error::NotFound);
        }

        Ok(DeleteResult {
            session_id: session_id.to_string(),
            entries_removed,
        })
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
        Ok(())
    }
}

impl Drop for SqliteSessionStore {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
