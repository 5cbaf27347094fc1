//! Domain model for queued entries, derived signals and day summaries.
//!
//! # Invariants
//! - Queue lifecycle state is a tagged union; a remote id exists only on
//!   synced records.
//! - Signals carry the extraction version that produced them.
//! - Day summaries are derived values with no identity beyond their date.

pub mod day_summary;
pub mod queued_record;
pub mod signal;

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
