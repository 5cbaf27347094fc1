//! Day score aggregation.
//!
//! # Responsibility
//! - Blend entry mood scores and signal sentiment into one value per day.
//! - Serve cached summaries, recomputing locally when the cache is stale.
//!
//! # Invariants
//! - `compute_local` is the single implementation of the blend; the cached
//!   summaries written by `refresh_cache` come from it too.
//! - Task entries, plan signals and dismissed signals never affect the score.
//! - `day_score` is `None` exactly when `score_source` is `None`.
//! - A cached summary is served only if its input id sets still match and it
//!   is at least as new as every input.

use crate::model::day_summary::{DayEntry, DaySummary, ScoreSource};
use crate::model::now_epoch_ms;
use crate::model::queued_record::EntryKind;
use crate::model::signal::Signal;
use crate::repo::document_store::{DocumentStore, StoreError, StoreResult};
use crate::service::signal_store::{SignalStore, SignalStoreError};
use chrono::{DateTime, FixedOffset};
use log::warn;
use std::sync::Arc;

pub const DAY_SUMMARIES_COLLECTION: &str = "day_summaries";

const RECORD_WEIGHT: f64 = 0.6;
const SIGNAL_WEIGHT: f64 = 0.4;

/// Blends one day's entries and signals into a summary.
pub fn compute_local(date_key: &str, entries: &[DayEntry], signals: &[Signal]) -> DaySummary {
    let moods: Vec<f64> = entries
        .iter()
        .filter(|entry| entry.kind != EntryKind::Task)
        .filter_map(|entry| entry.mood_score)
        .filter(|score| score.is_finite())
        .collect();
    let sentiments: Vec<f64> = signals
        .iter()
        .filter(|signal| signal.counts_toward_sentiment())
        .map(|signal| signal.sentiment.score())
        .collect();

    let record_mood_avg = mean(&moods);
    let signal_sentiment_avg = mean(&sentiments).map(|avg| (avg + 1.0) / 2.0);

    let (day_score, score_source) = match (record_mood_avg, signal_sentiment_avg) {
        (Some(mood), Some(sentiment)) => (
            Some(RECORD_WEIGHT * mood + SIGNAL_WEIGHT * sentiment),
            ScoreSource::Blended,
        ),
        (Some(mood), None) => (Some(mood), ScoreSource::RecordsOnly),
        (None, Some(sentiment)) => (Some(sentiment), ScoreSource::SignalsOnly),
        (None, None) => (None, ScoreSource::None),
    };

    DaySummary {
        date_key: date_key.to_string(),
        day_score: day_score.map(|score| score.clamp(0.0, 1.0)),
        record_mood_avg,
        signal_sentiment_avg,
        score_source,
        record_count: moods.len(),
        signal_count: sentiments.len(),
        computed_at_ms: now_epoch_ms(),
        entry_ids: sorted_ids(entries.iter().map(|entry| entry.id.as_str())),
        signal_ids: sorted_ids(signals.iter().map(|signal| signal.id.as_str())),
    }
}

fn sorted_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut ids: Vec<String> = ids.map(str::to_string).collect();
    ids.sort_unstable();
    ids
}

/// Calendar day (`YYYY-MM-DD`) of `epoch_ms` in a fixed UTC offset.
///
/// Returns `None` for out-of-range timestamps or offsets.
pub fn date_key_for(epoch_ms: i64, utc_offset_minutes: i32) -> Option<String> {
    let offset = FixedOffset::east_opt(utc_offset_minutes.checked_mul(60)?)?;
    let instant = DateTime::from_timestamp_millis(epoch_ms)?;
    Some(instant.with_timezone(&offset).format("%Y-%m-%d").to_string())
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Cached day summaries with local recomputation as fallback.
pub struct DayScoreService {
    store: Arc<dyn DocumentStore>,
    signals: SignalStore,
}

impl DayScoreService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            signals: SignalStore::new(Arc::clone(&store)),
            store,
        }
    }

    pub fn cached_summary(&self, date_key: &str) -> StoreResult<Option<DaySummary>> {
        self.store
            .get(DAY_SUMMARIES_COLLECTION, date_key)?
            .map(|document| document.decode::<DaySummary>())
            .transpose()
    }

    /// Summary for `date_key` given the day's entries.
    ///
    /// Uses the cached copy when it was computed from the same entries and
    /// signals and is at least as new as every input; otherwise, or when the
    /// cache cannot be read, recomputes locally.
    pub fn summary_for_day(
        &self,
        date_key: &str,
        entries: &[DayEntry],
    ) -> Result<DaySummary, SignalStoreError> {
        let signals = self.signals.signals_for_date(date_key)?;
        let newest_input = entries
            .iter()
            .map(|entry| entry.updated_at_ms)
            .chain(signals.iter().map(|signal| signal.updated_at_ms))
            .max();

        let entry_ids = sorted_ids(entries.iter().map(|entry| entry.id.as_str()));
        let signal_ids = sorted_ids(signals.iter().map(|signal| signal.id.as_str()));

        match self.cached_summary(date_key) {
            Ok(Some(cached))
                if cached.entry_ids == entry_ids
                    && cached.signal_ids == signal_ids
                    && newest_input.map_or(true, |t| cached.computed_at_ms >= t) =>
            {
                return Ok(cached);
            }
            Ok(_) => {}
            Err(err) => warn!(
                "event=day_summary_cache module=service status=error date_key={date_key} error={err}"
            ),
        }
        Ok(compute_local(date_key, entries, &signals))
    }

    /// Recomputes and stores the summary for `date_key`.
    pub fn refresh_cache(
        &self,
        date_key: &str,
        entries: &[DayEntry],
    ) -> Result<DaySummary, SignalStoreError> {
        let signals = self.signals.signals_for_date(date_key)?;
        let summary = compute_local(date_key, entries, &signals);
        let body = serde_json::to_value(&summary).map_err(StoreError::from)?;
        self.store.set(DAY_SUMMARIES_COLLECTION, date_key, &body)?;
        Ok(summary)
    }
}
