//! Persistent memory: content-addressed storage with write-time semantic
//! deduplication, tag-indexed recall, and hierarchical decay.

pub mod decay;
pub mod store;

pub use decay::DecayWorker;
pub use store::SqliteMemoryStore;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// How compressed a memory is. Memories decay over time:
/// full text -> summary -> keywords -> evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayLevel {
    /// Original text, no compression.
    Full,
    /// Extractive summary, ~20% of the original.
    Summary,
    /// Keywords only, ~5% of the original.
    Keywords,
}

impl DecayLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            DecayLevel::Full => 0,
            DecayLevel::Summary => 1,
            DecayLevel::Keywords => 2,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => DecayLevel::Summary,
            2 => DecayLevel::Keywords,
            _ => DecayLevel::Full,
        }
    }
}

/// Input for storing memories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreRequest {
    #[serde(default)]
    pub session_id: String,
    pub entries: Vec<StoreEntry>,
}

/// A single entry in a store request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreEntry {
    pub text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Output of a store operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreResult {
    pub stored: usize,
    pub deduplicated: usize,
    pub total_memories: usize,
}

/// Input for recalling memories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub query_embedding: Vec<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional token budget over returned texts. Zero means unlimited.
    #[serde(default)]
    pub max_tokens: usize,
    /// Maximum memories to return. Zero means the default of 10.
    #[serde(default)]
    pub max_results: usize,
    /// Blend factor between similarity (0.0) and recency (1.0).
    #[serde(default)]
    pub recency_weight: f64,
}

/// Output of a recall operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallResult {
    pub memories: Vec<RecalledMemory>,
    pub stats: RecallStats,
}

/// A single memory returned from recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub relevance: f64,
    pub decay_level: DecayLevel,
    pub last_referenced: DateTime<Utc>,
}

/// Recall operation metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallStats {
    pub candidates: usize,
    pub deduplicated: usize,
    pub returned: usize,
    pub token_count: usize,
}

/// Which memories to remove. Filters combine conjunctively; an empty
/// request removes nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgetRequest {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub older_than: Option<DateTime<Utc>>,
}

/// Output of a forget operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForgetResult {
    pub removed: usize,
    pub total_memories: usize,
}

/// Memory store statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total_memories: usize,
    pub by_decay_level: HashMap<i64, i64>,
    pub by_source: HashMap<String, i64>,
    pub oldest_memory: Option<DateTime<Utc>>,
    pub newest_memory: Option<DateTime<Utc>>,
}

/// Capability set for persistent memory backends.
///
/// The SQLite implementation is the canonical one; alternatives must
/// preserve the same dedup, ordering, and decay invariants.
pub trait MemoryStore: Send + Sync {
    /// Add entries with write-time deduplication.
    fn store(&self, req: StoreRequest, cancel: &CancellationToken) -> Result<StoreResult>;

    /// Retrieve memories matching a query, ranked by relevance and recency.
    fn recall(&self, req: RecallRequest, cancel: &CancellationToken) -> Result<RecallResult>;

    /// Remove memories matching the given criteria.
    fn forget(&self, req: ForgetRequest, cancel: &CancellationToken) -> Result<ForgetResult>;

    /// Store statistics.
    fn stats(&self, cancel: &CancellationToken) -> Result<MemoryStats>;

    /// Release the store handle. Later calls fail with `StoreClosed`.
    fn close(&self) -> Result<()>;
}
