//! Deterministic text compression cascade.
//!
//! Sessions shrink entries through four levels (full, summary, sentence,
//! keywords); memory decay uses a three-level cascade (full, summary,
//! keywords). Every transform is a pure function of its input, so
//! recompressing `original_content` never accumulates loss beyond the
//! chosen level.

pub mod extractive;
pub mod keywords;

pub use extractive::summarize;
pub use keywords::extract_keywords;

use serde::{Deserialize, Serialize};

/// Keyword cap for the session cascade.
pub const SESSION_KEYWORD_CAP: usize = 15;
/// Keyword cap for the memory decay cascade.
pub const MEMORY_KEYWORD_CAP: usize = 20;

/// How compressed a session entry is. Monotonically non-decreasing for any
/// given entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Original content.
    Full,
    /// Extractive summary, ~20% of the original.
    Summary,
    /// First sentence only, ~5%.
    Sentence,
    /// Keyword bag, ~1%.
    Keywords,
}

impl CompressionLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            CompressionLevel::Full => 0,
            CompressionLevel::Summary => 1,
            CompressionLevel::Sentence => 2,
            CompressionLevel::Keywords => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => CompressionLevel::Summary,
            2 => CompressionLevel::Sentence,
            3 => CompressionLevel::Keywords,
            _ => CompressionLevel::Full,
        }
    }

    /// The next, more aggressive level; `None` past keywords (eviction).
    pub fn next(self) -> Option<Self> {
        match self {
            CompressionLevel::Full => Some(CompressionLevel::Summary),
            CompressionLevel::Summary => Some(CompressionLevel::Sentence),
            CompressionLevel::Sentence => Some(CompressionLevel::Keywords),
            CompressionLevel::Keywords => None,
        }
    }
}

/// Apply the session cascade transform for the given target level.
/// Always applied to the original content, never to an already-compressed
/// form.
pub fn compress_to_level(text: &str, level: CompressionLevel) -> String {
    match level {
        CompressionLevel::Full => text.to_string(),
        CompressionLevel::Summary => summarize(text),
        CompressionLevel::Sentence => first_sentence(text),
        CompressionLevel::Keywords => extract_keywords(text, SESSION_KEYWORD_CAP),
    }
}

/// Keep the substring up to and including the first sentence terminator.
/// Without one, truncate at the last whitespace within the first 50 bytes
/// and append `"..."`; with no whitespace there either, hard-cut at byte 50.
pub fn first_sentence(text: &str) -> String {
    for (i, b) in text.as_bytes().iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            return text[..=i].to_string();
        }
    }

    if text.len() <= 50 {
        return text.to_string();
    }

    let mut cut = 0;
    for (i, c) in text.char_indices() {
        if i >= 50 {
            break;
        }
        if c.is_whitespace() {
            cut = i;
        }
    }
    if cut == 0 {
        cut = 50;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
    }
    format!("{}...", text[..cut].trim_end())
}
