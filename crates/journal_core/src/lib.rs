//! Core domain logic for offline journaling.
//!
//! Entries captured offline wait in a device-local queue until the sync
//! orchestrator submits them. Signals derived from entry text are written
//! under per-entry extraction versions, and day summaries blend entry mood
//! with signal sentiment.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod queue;
pub mod repo;
pub mod service;
pub mod sync;

pub use config::{ConfigError, CoreConfig, EditPolicy, LoggingConfig, SyncPolicy};
pub use logging::{default_log_level, init_logging, logging_status, LoggingStatus};
pub use model::day_summary::{DayEntry, DaySummary, ScoreSource};
pub use model::queued_record::{
    EntryDraft, EntryKind, LocalId, QueueState, QueuedRecord, SyncStatus,
};
pub use model::signal::{Sentiment, Signal, SignalDraft, SignalKind, SignalStatus};
pub use queue::{LocalQueue, QueueError, QueueMeta, QueueResult, QueueStats};
pub use repo::document_store::{
    Document, DocumentStore, SqliteDocumentStore, StoreError, StoreResult, WriteOp,
};
pub use repo::kv_store::{KeyValueStore, KvError, SqliteKeyValueStore};
pub use service::change_detector::{assess_change, normalize_text, ChangeAssessment};
pub use service::day_score::{compute_local, date_key_for, DayScoreService};
pub use service::edit_pipeline::{
    BackgroundEnrichment, EditOutcome, EditPipeline, EnrichmentFailure, ExtractionError,
    SignalExtractor,
};
pub use service::extraction_version::{VersionCounter, VersionError};
pub use service::signal_store::{SaveOutcome, SignalStore, SignalStoreError};
pub use sync::{
    AttemptOutcome, RecordSubmitter, Sleeper, SubmitError, SubmitReceipt, Subscription,
    SyncEvent, SyncOptions, SyncOrchestrator, SyncReport,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
