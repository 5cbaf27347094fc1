//! Derived signal model.
//!
//! # Responsibility
//! - Describe dated facts extracted from entry text.
//! - Own the sentiment-to-score mapping used by day aggregation.
//!
//! # Invariants
//! - `extraction_version >= 1`.
//! - `Verified` and `Dismissed` are terminal statuses.
//! - Plan signals never contribute to sentiment scores.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// What a signal describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Something the author intends to do on `target_date`.
    Plan,
    /// Something the author felt or noticed.
    Observation,
    /// A mention of a past day.
    Reference,
}

/// Sentiment label attached by extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Excited,
    Hopeful,
    Neutral,
    Anxious,
    Negative,
    Dreading,
}

impl Sentiment {
    /// Maps the label onto `[-1, 1]`.
    pub fn score(self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Excited => 0.8,
            Self::Hopeful => 0.6,
            Self::Neutral => 0.0,
            Self::Anxious => -0.3,
            Self::Negative => -0.5,
            Self::Dreading => -0.7,
        }
    }
}

/// User review state of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Active,
    Verified,
    Dismissed,
}

impl SignalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Verified => "verified",
            Self::Dismissed => "dismissed",
        }
    }
}

impl Display for SignalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extractor output before the store assigns identity and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalDraft {
    /// Calendar day (`YYYY-MM-DD`) the signal is about.
    pub target_date: String,
    pub kind: SignalKind,
    pub content: String,
    pub sentiment: Sentiment,
    pub confidence: f64,
}

/// Persisted signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub source_record_id: String,
    pub extraction_version: u32,
    pub target_date: String,
    pub kind: SignalKind,
    pub content: String,
    pub sentiment: Sentiment,
    pub confidence: f64,
    pub status: SignalStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Signal {
    /// Whether this signal feeds the day sentiment average.
    pub fn counts_toward_sentiment(&self) -> bool {
        self.kind != SignalKind::Plan && self.status != SignalStatus::Dismissed
    }
}
