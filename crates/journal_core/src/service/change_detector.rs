//! Meaningful-change detection for entry edits.
//!
//! # Responsibility
//! - Decide whether an edit is worth a new extraction run.
//!
//! # Invariants
//! - Comparison runs on normalized text: lowercase, punctuation stripped,
//!   whitespace collapsed.
//! - Changed words are counted as a multiset difference, so one replaced word
//!   counts twice (one removed, one added).

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static PUNCTUATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]+").expect("valid punctuation regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Result of comparing two entry texts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeAssessment {
    pub changed_words: usize,
    pub meaningful: bool,
}

/// Lowercases, strips punctuation and collapses whitespace.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = PUNCTUATION_RE.replace_all(&lowered, "");
    WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

/// Words added plus words removed between two normalized texts.
pub fn changed_word_count(old_normalized: &str, new_normalized: &str) -> usize {
    let mut balance: HashMap<&str, i64> = HashMap::new();
    for word in old_normalized.split_whitespace() {
        *balance.entry(word).or_default() += 1;
    }
    for word in new_normalized.split_whitespace() {
        *balance.entry(word).or_default() -= 1;
    }
    balance.values().map(|delta| delta.unsigned_abs() as usize).sum()
}

/// Compares two entry texts against the `min_changed_words` threshold.
pub fn assess_change(old_text: &str, new_text: &str, min_changed_words: usize) -> ChangeAssessment {
    let old_normalized = normalize_text(old_text);
    let new_normalized = normalize_text(new_text);
    if old_normalized == new_normalized {
        return ChangeAssessment {
            changed_words: 0,
            meaningful: false,
        };
    }

    let changed_words = changed_word_count(&old_normalized, &new_normalized);
    ChangeAssessment {
        changed_words,
        meaningful: changed_words >= min_changed_words,
    }
}
