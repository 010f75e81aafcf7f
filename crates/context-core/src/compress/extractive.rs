//! Extractive summarization: the level-1 transform of both cascades.
//!
//! Scores sentences by position, length, and keyword density, then keeps the
//! highest-scoring ones within ~20% of the original token estimate. Purely
//! lexical: no model calls, equal inputs always produce equal outputs.

use lazy_static::lazy_static;
use regex::Regex;

use super::keywords::is_stop_word;
use crate::tokens::estimate_tokens;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();

    /// Terms that mark a sentence as carrying domain signal. Fixed so the
    /// scorer stays deterministic across releases.
    static ref DOMAIN_TERMS: Vec<&'static str> = vec![
        "error", "token", "service", "api", "config", "database", "request",
        "cache", "auth", "server", "client", "session", "file", "function",
        "test", "query", "index", "key", "secret", "timeout",
    ];
}

/// Fraction of the input token estimate the summary may keep.
const TARGET_REDUCTION: f64 = 0.2;

const POSITION_WEIGHT: f64 = 0.45;
const LENGTH_WEIGHT: f64 = 0.25;
const KEYWORD_WEIGHT: f64 = 0.30;

/// Produce an extractive summary of roughly 20% of the input's token
/// estimate. Selected sentences are emitted in their original order. When
/// no sentence fits the budget at all, the input is returned unchanged
/// rather than truncated mid-thought.
pub fn summarize(text: &str) -> String {
    let sentences = split_sentences(text);
    if sentences.len() <= 1 {
        return text.to_string();
    }

    let input_tokens = estimate_tokens(text);
    let budget = ((input_tokens as f64) * TARGET_REDUCTION).ceil() as usize;

    // Rank by score descending. The sort is stable, so equal scores keep
    // document order.
    let mut ranked: Vec<usize> = (0..sentences.len()).collect();
    let scores: Vec<f64> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| score_sentence(s, i))
        .collect();
    ranked.sort_by(|a, b| scores[*b].partial_cmp(&scores[*a]).unwrap_or(std::cmp::Ordering::Equal));

    // Walk the ranking, keeping every sentence that still fits the budget.
    let mut selected = vec![false; sentences.len()];
    let mut used = 0usize;
    for idx in ranked {
        let cost = estimate_tokens(sentences[idx]);
        if used + cost > budget {
            continue;
        }
        selected[idx] = true;
        used += cost;
    }

    if used == 0 {
        return text.to_string();
    }

    let kept: Vec<&str> = sentences
        .iter()
        .enumerate()
        .filter(|(i, _)| selected[*i])
        .map(|(_, s)| *s)
        .collect();

    WHITESPACE.replace_all(kept.join(" ").trim(), " ").into_owned()
}

/// Split text into sentences on `.`, `!`, `?`. A trailing fragment without a
/// terminator counts as a sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;

    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            let s = text[start..=i].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = i + 1;
        }
    }
    if start < text.len() {
        let s = text[start..].trim();
        if !s.is_empty() {
            sentences.push(s);
        }
    }

    sentences
}

fn score_sentence(sentence: &str, index: usize) -> f64 {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }

    // Earlier sentences carry more context in agent output.
    let position = 1.0 / (1.0 + index as f64 * 0.25);

    // Prefer moderate length over fragments and run-ons.
    let n = words.len() as f64;
    let length = if (6.0..=30.0).contains(&n) {
        1.0
    } else if n < 6.0 {
        n / 6.0
    } else {
        30.0 / n
    };

    // Density of capitalized tokens, numbers, and domain terms.
    let significant = words
        .iter()
        .filter(|w| {
            w.chars().next().is_some_and(|c| c.is_ascii_uppercase())
                || w.chars().any(|c| c.is_ascii_digit())
                || is_domain_term(w)
        })
        .count() as f64;
    let density = (significant / n).min(1.0);

    POSITION_WEIGHT * position + LENGTH_WEIGHT * length + KEYWORD_WEIGHT * density
}

fn is_domain_term(word: &str) -> bool {
    let lower = word
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if lower.is_empty() || is_stop_word(&lower) {
        return false;
    }
    DOMAIN_TERMS.iter().any(|t| lower.starts_with(t))
}
