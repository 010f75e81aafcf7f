//! Store configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

/// Memory store and decay worker configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Cosine distance below which two entries are considered duplicates.
    pub dedup_threshold: f64,
    /// Whether the background decay worker runs.
    pub decay_enabled: bool,
    /// How often the decay worker runs a pass.
    pub decay_interval: Duration,
    /// Age after which full-text memories are compressed to summaries.
    pub summary_age: Duration,
    /// Age after which summaries are compressed to keywords.
    pub keywords_age: Duration,
    /// Age after which keyword-level memories are evicted. Zero disables
    /// eviction.
    pub evict_age: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.15,
            decay_enabled: true,
            decay_interval: Duration::from_secs(60 * 60),
            summary_age: Duration::from_secs(24 * 60 * 60),
            keywords_age: Duration::from_secs(168 * 60 * 60),
            evict_age: Duration::from_secs(720 * 60 * 60),
        }
    }
}

impl MemoryConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cfg = Self {
            dedup_threshold: env_or("MEMORY_DEDUP_THRESHOLD", defaults.dedup_threshold),
            decay_enabled: env_or("MEMORY_DECAY_ENABLED", defaults.decay_enabled),
            decay_interval: secs_or("MEMORY_DECAY_INTERVAL_SECS", defaults.decay_interval),
            summary_age: secs_or("MEMORY_SUMMARY_AGE_SECS", defaults.summary_age),
            keywords_age: secs_or("MEMORY_KEYWORDS_AGE_SECS", defaults.keywords_age),
            evict_age: secs_or("MEMORY_EVICT_AGE_SECS", defaults.evict_age),
        };
        info!(
            dedup_threshold = cfg.dedup_threshold,
            decay_enabled = cfg.decay_enabled,
            "loaded memory config"
        );
        cfg
    }
}

/// Session store configuration: defaults applied when a create request
/// leaves a field unset.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default token budget for new sessions.
    pub default_max_tokens: usize,
    /// Default cosine distance below which entries are duplicates.
    pub default_dedup_threshold: f64,
    /// Default count of most-recent entries exempt from compression.
    pub default_preserve_recent: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 128_000,
            default_dedup_threshold: 0.15,
            default_preserve_recent: 10,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_max_tokens: env_or("SESSION_DEFAULT_MAX_TOKENS", defaults.default_max_tokens),
            default_dedup_threshold: env_or(
                "SESSION_DEDUP_THRESHOLD",
                defaults.default_dedup_threshold,
            ),
            default_preserve_recent: env_or(
                "SESSION_PRESERVE_RECENT",
                defaults.default_preserve_recent,
            ),
        }
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_defaults() {
        let cfg = MemoryConfig::default();
        assert_eq!(cfg.dedup_threshold, 0.15);
        assert!(cfg.decay_enabled);
        assert_eq!(cfg.decay_interval, Duration::from_secs(3600));
        assert_eq!(cfg.summary_age, Duration::from_secs(86_400));
        assert_eq!(cfg.keywords_age, Duration::from_secs(604_800));
        assert_eq!(cfg.evict_age, Duration::from_secs(2_592_000));
    }

    #[test]
    fn test_session_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.default_max_tokens, 128_000);
        assert_eq!(cfg.default_dedup_threshold, 0.15);
        assert_eq!(cfg.default_preserve_recent, 10);
    }
}
