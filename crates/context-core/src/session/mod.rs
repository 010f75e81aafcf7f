//! Session context windows: token-budgeted, ordered logs of entries pushed
//! by an agent during a task. Entries are deduplicated on push; when the
//! budget is exceeded the window self-regulates by compressing the least
//! important old entries and evicting only as a last resort.

pub mod store;

pub use store::SqliteSessionStore;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use crate::compress::CompressionLevel;
use crate::error::Result;

/// Session descriptor plus aggregate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub max_tokens: usize,
    pub dedup_threshold: f64,
    pub preserve_recent: usize,
    pub current_tokens: usize,
    pub entry_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a session. Zero/empty fields fall back to the
/// store's configured defaults; an empty id is auto-generated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub max_tokens: usize,
    #[serde(default)]
    pub dedup_threshold: f64,
    #[serde(default)]
    pub preserve_recent: usize,
}

/// Input for adding entries to a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushRequest {
    pub session_id: String,
    pub entries: Vec<PushEntry>,
}

/// A single entry in a push request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushEntry {
    /// user, assistant, tool, system, or any free-form role.
    #[serde(default)]
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// 0-1; higher entries are compressed last. Non-positive values take
    /// the default of 0.5.
    #[serde(default)]
    pub importance: f64,
}

/// Output of a push operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResult {
    pub session_id: String,
    pub accepted: usize,
    pub deduplicated: usize,
    pub compressed: usize,
    pub evicted: usize,
    pub current_tokens: usize,
    pub budget_remaining: i64,
}

/// Input for reading a session's context window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRequest {
    pub session_id: String,
    /// 0 returns the full window.
    #[serde(default)]
    pub max_tokens: usize,
    /// Empty returns all roles.
    #[serde(default)]
    pub role: String,
}

/// Output of a context read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextResult {
    pub entries: Vec<ContextEntry>,
    pub stats: ContextStats,
}

/// A single entry returned from a context read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub source: String,
    pub level: CompressionLevel,
    pub tokens: usize,
    /// Age relative to now: `{N}s`, `{N}m`, `{N}h`, or `{N}d`.
    pub age: String,
}

/// Context window metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextStats {
    pub total_entries: usize,
    pub total_tokens: usize,
    pub compression_levels: HashMap<i64, i64>,
    /// Tokens saved by compression across the whole session.
    pub compression_savings: i64,
}

/// Output of deleting a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteResult {
    pub session_id: String,
    pub entries_removed: usize,
}

/// Capability set for session context backends.
pub trait SessionStore: Send + Sync {
    /// Create a session; fails with `SessionExists` on id collision.
    fn create(&self, req: CreateRequest, cancel: &CancellationToken) -> Result<Session>;

    /// Add entries with dedup and synchronous budget enforcement.
    fn push(&self, req: PushRequest, cancel: &CancellationToken) -> Result<PushResult>;

    /// Read the context window in push order.
    fn context(&self, req: ContextRequest, cancel: &CancellationToken) -> Result<ContextResult>;

    /// Session metadata plus aggregate counters.
    fn get(&self, session_id: &str, cancel: &CancellationToken) -> Result<Session>;

    /// Remove a session and all its entries.
    fn delete(&self, session_id: &str, cancel: &CancellationToken) -> Result<DeleteResult>;

    /// Release the store handle. Later calls fail with `StoreClosed`.
    fn close(&self) -> Result<()>;
}

/// Format an age as the largest whole unit: seconds, minutes, hours, days.
pub(crate) fn format_age(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}
