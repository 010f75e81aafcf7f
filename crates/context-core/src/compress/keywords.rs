//! Keyword-bag compression, the terminal level of both cascades.

use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    /// Common English stop words filtered during keyword extraction.
    /// This set is stable across releases: stored keyword text must not
    /// change meaning when re-derived.
    static ref STOP_WORDS: HashSet<&'static str> = [
        "that", "this", "with", "from",
        "have", "been", "were", "they",
        "their", "which", "would", "there",
        "about", "could", "other", "into",
        "more", "some", "than", "them",
        "very", "when", "what", "your",
        "also", "each", "does", "will",
        "just", "should", "because", "these",
    ]
    .into_iter()
    .collect();
}

const TRIM_CHARS: &[char] = &[
    '.', ',', ';', ':', '!', '?', '"', '\'', '(', ')', '[', ']', '{', '}',
];

/// Reduce text to a comma-separated bag of significant words.
///
/// Words are lowercased, stripped of surrounding punctuation, filtered for
/// length (>= 4 bytes) and stop words, deduplicated preserving first-seen
/// order, and capped at `max_keywords`.
pub fn extract_keywords(text: &str, max_keywords: usize) -> String {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for word in text.split_whitespace() {
        let lower = word.trim_matches(TRIM_CHARS).to_lowercase();
        if lower.len() < 4 || STOP_WORDS.contains(lower.as_str()) {
            continue;
        }
        if seen.insert(lower.clone()) {
            keywords.push(lower);
        }
        if keywords.len() >= max_keywords {
            break;
        }
    }

    keywords.join(", ")
}

/// Whether a word is in the fixed stop-word set.
pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_short_and_stop_words() {
        let out = extract_keywords("the JWT is signed with RS256 keys", 20);
        assert_eq!(out, "signed, rs256, keys");
    }

    #[test]
    fn test_dedup_preserves_first_seen_order() {
        let out = extract_keywords("tokens expire, tokens rotate, tokens", 20);
        assert_eq!(out, "tokens, expire, rotate");
    }

    #[test]
    fn test_strips_punctuation() {
        let out = extract_keywords("(auth) [service]: \"validates\"!", 20);
        assert_eq!(out, "auth, service, validates");
    }

    #[test]
    fn test_caps_keyword_count() {
        let text = "alpha bravo charlie delta echoed foxtrot golfing hotel";
        let out = extract_keywords(text, 3);
        assert_eq!(out.split(", ").count(), 3);
    }

    #[test]
    fn test_deterministic() {
        let text = "Refresh tokens are stored in Redis with a 7-day TTL.";
        assert_eq!(extract_keywords(text, 15), extract_keywords(text, 15));
    }
}
