//! Day summary model.

use crate::model::queued_record::EntryKind;
use serde::{Deserialize, Serialize};

/// Which inputs produced `DaySummary::day_score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Blended,
    RecordsOnly,
    SignalsOnly,
    None,
}

/// Blended mood for one calendar day.
///
/// Recomputable from its inputs at any time; `computed_at_ms` only exists so
/// cached copies can be checked for staleness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date_key: String,
    /// Within `[0, 1]` when present.
    pub day_score: Option<f64>,
    pub record_mood_avg: Option<f64>,
    /// Sentiment average already rescaled to `[0, 1]`.
    pub signal_sentiment_avg: Option<f64>,
    pub score_source: ScoreSource,
    pub record_count: usize,
    pub signal_count: usize,
    pub computed_at_ms: i64,
    /// Sorted ids of every entry handed to the computation.
    #[serde(default)]
    pub entry_ids: Vec<String>,
    /// Sorted ids of every signal targeting the day at computation time.
    /// Deleted signals leave no timestamp behind, so the id set is what
    /// tells a cached copy it is stale.
    #[serde(default)]
    pub signal_ids: Vec<String>,
}

/// Read-only view of a synced entry used by day aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayEntry {
    pub id: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub mood_score: Option<f64>,
    pub updated_at_ms: i64,
}
