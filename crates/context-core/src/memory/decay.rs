//! Background decay worker.
//!
//! Each pass advances aging memories one level down the cascade and sweeps
//! terminal-level rows past the eviction age. Accessing a memory (recall or
//! write-time dedup merge) resets `last_referenced`, which is the sole
//! mechanism that keeps frequently-used entries stable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::params;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compress::{extract_keywords, summarize, MEMORY_KEYWORD_CAP};
use crate::config::MemoryConfig;
use crate::db;
use crate::error::{Error, Result};

use super::DecayLevel;
use super::SqliteMemoryStore;

/// Hard deadline on a single pass so a large backlog cannot monopolize the
/// single writer.
const PASS_DEADLINE: Duration = Duration::from_secs(30);

/// Counts from one decay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub evicted: usize,
    pub to_keywords: usize,
    pub to_summary: usize,
}

/// Periodic compression of aging memories:
///
/// full text -> summary -> keywords -> evicted
pub struct DecayWorker {
    store: Arc<SqliteMemoryStore>,
    cfg: MemoryConfig,
    cancel: CancellationToken,
}

impl DecayWorker {
    pub fn new(store: Arc<SqliteMemoryStore>, cfg: MemoryConfig) -> Self {
        Self {
            store,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the periodic decay loop. The returned handle resolves after
    /// `stop()`; any pass already running completes first.
    pub fn start(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let cfg = self.cfg.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.decay_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so the first
            // pass runs one full interval after start.
            ticker.tick().await;

            info!(interval_secs = cfg.decay_interval.as_secs(), "decay worker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let store = Arc::clone(&store);
                        let cfg = cfg.clone();
                        let cancel = cancel.clone();
                        let pass = tokio::task::spawn_blocking(move || {
                            run_pass(&store, &cfg, &cancel)
                        })
                        .await;
                        match pass {
                            Ok(Ok(stats)) => debug!(
                                evicted = stats.evicted,
                                to_keywords = stats.to_keywords,
                                to_summary = stats.to_summary,
                                "decay pass complete"
                            ),
                            Ok(Err(Error::Cancelled)) => break,
                            Ok(Err(e)) => warn!(error = %e, "decay pass failed"),
                            Err(e) => warn!(error = %e, "decay pass panicked"),
                        }
                    }
                }
            }
            info!("decay worker stopped");
        })
    }

    /// Signal the worker to stop. No new pass starts after this returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Execute a single decay pass synchronously. Exposed for hosts that
    /// schedule passes themselves and for tests.
    pub fn run_once(&self) -> Result<PassStats> {
        run_pass(&self.store, &self.cfg, &self.cancel)
    }
}

fn run_pass(
    store: &SqliteMemoryStore,
    cfg: &MemoryConfig,
    cancel: &CancellationToken,
) -> Result<PassStats> {
    let deadline = Instant::now() + PASS_DEADLINE;
    let now = Utc::now();
    let mut stats = PassStats::default();

    // Evict first so already-terminal rows are gone before earlier rows
    // advance into the terminal level.
    if !cfg.evict_age.is_zero() {
        let conn = store.conn()?;
        let cutoff = db::format_ts(now - chrono::Duration::from_std(cfg.evict_age).unwrap_or_else(|_| chrono::Duration::zero()));
        stats.evicted = conn.execute(
            "DELETE FROM memories WHERE last_referenced < ?1 AND decay_level >= ?2",
            params![cutoff, DecayLevel::Keywords.as_i64()],
        )?;
    }

    // Keywords before summaries so a single pass never moves a row two
    // levels.
    if !cfg.keywords_age.is_zero() {
        check_pass(cancel, deadline)?;
        let cutoff = db::format_ts(now - chrono::Duration::from_std(cfg.keywords_age).unwrap_or_else(|_| chrono::Duration::zero()));
        stats.to_keywords = decay_rows(
            store,
            cancel,
            &cutoff,
            DecayLevel::Summary,
            DecayLevel::Keywords,
            |text| extract_keywords(text, MEMORY_KEYWORD_CAP),
        )?;
    }

    if !cfg.summary_age.is_zero() {
        check_pass(cancel, deadline)?;
        let cutoff = db::format_ts(now - chrono::Duration::from_std(cfg.summary_age).unwrap_or_else(|_| chrono::Duration::zero()));
        stats.to_summary = decay_rows(
            store,
            cancel,
            &cutoff,
            DecayLevel::Full,
            DecayLevel::Summary,
            summarize,
        )?;
    }

    Ok(stats)
}

fn check_pass(cancel: &CancellationToken, deadline: Instant) -> Result<()> {
    if cancel.is_cancelled() || Instant::now() >= deadline {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Rewrite rows at `from` level whose last reference predates `cutoff`,
/// applying `transform` and advancing them to `to`.
fn decay_rows<F>(
    store: &SqliteMemoryStore,
    cancel: &CancellationToken,
    cutoff: &str,
    from: DecayLevel,
    to: DecayLevel,
    transform: F,
) -> Result<usize>
where
    F: Fn(&str) -> String,
{
    let conn = store.conn()?;

    let mut stmt = conn.prepare(
        "SELECT id, text FROM memories WHERE last_referenced < ?1 AND decay_level = ?2",
    )?;
    let rows = stmt.query_map(params![cutoff, from.as_i64()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let entries: Vec<(String, String)> = rows.collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut advanced = 0;
    for (id, text) in entries {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let compressed = transform(&text);
        conn.execute(
            "UPDATE memories SET text = ?1, decay_level = ?2 WHERE id = ?3",
            params![compressed, to.as_i64(), id],
        )?;
        advanced += 1;
    }

    Ok(advanced)
}
