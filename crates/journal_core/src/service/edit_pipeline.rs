//! Entry save/edit workflow for signal extraction.
//!
//! # Responsibility
//! - Skip re-extraction for cosmetic edits.
//! - Reserve a new extraction version before extracting.
//! - Save extraction output through the version-checked signal store.
//! - Run the same workflow on a background thread for callers that must not
//!   wait on enrichment.
//!
//! # Invariants
//! - Version conflicts are retried up to `EditPolicy::max_conflict_retries`
//!   and then returned to the caller.
//! - Extraction and signal-save failures never fail the entry save; they are
//!   logged and reported as `EditOutcome::ExtractionFailed`.

use crate::config::EditPolicy;
use crate::logging::truncate_single_line;
use crate::model::signal::SignalDraft;
use crate::repo::document_store::DocumentStore;
use crate::service::change_detector::assess_change;
use crate::service::extraction_version::{VersionCounter, VersionError};
use crate::service::signal_store::SignalStore;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Extraction failure reported by a `SignalExtractor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionError {
    pub message: String,
}

impl ExtractionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for ExtractionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for ExtractionError {}

/// Derives dated signals from entry text.
pub trait SignalExtractor: Send + Sync {
    fn extract(&self, entry_id: &str, text: &str) -> Result<Vec<SignalDraft>, ExtractionError>;
}

/// What the workflow did for one save or edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// Cosmetic edit; no version bump, no extraction.
    Unchanged { changed_words: usize },
    Extracted {
        version: u32,
        written: usize,
        deleted: usize,
    },
    /// A newer extraction finished first; this run's output was dropped.
    Superseded { version: u32, newest: u32 },
    /// `version` is 0 when a background run could not reserve a version.
    ExtractionFailed { version: u32, error: String },
}

/// Synchronous save/edit workflow.
pub struct EditPipeline {
    versions: VersionCounter,
    signals: SignalStore,
    extractor: Arc<dyn SignalExtractor>,
    policy: EditPolicy,
}

impl EditPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        extractor: Arc<dyn SignalExtractor>,
        policy: EditPolicy,
    ) -> Self {
        Self {
            versions: VersionCounter::new(Arc::clone(&store)),
            signals: SignalStore::new(store),
            extractor,
            policy,
        }
    }

    pub fn signals(&self) -> &SignalStore {
        &self.signals
    }

    pub fn versions(&self) -> &VersionCounter {
        &self.versions
    }

    /// First extraction for a newly saved entry.
    pub fn on_entry_saved(&self, entry_id: &str, text: &str) -> Result<EditOutcome, VersionError> {
        let version = self.reserve_version(entry_id)?;
        Ok(self.extract_and_save(entry_id, text, version))
    }

    /// Re-extraction after an edit, skipped for cosmetic changes.
    pub fn on_entry_edited(
        &self,
        entry_id: &str,
        old_text: &str,
        new_text: &str,
    ) -> Result<EditOutcome, VersionError> {
        let assessment = assess_change(old_text, new_text, self.policy.min_changed_words);
        if !assessment.meaningful {
            info!(
                "event=entry_edit module=service status=skipped entry_id={} changed_words={}",
                entry_id, assessment.changed_words
            );
            return Ok(EditOutcome::Unchanged {
                changed_words: assessment.changed_words,
            });
        }

        let version = self.reserve_version(entry_id)?;
        Ok(self.extract_and_save(entry_id, new_text, version))
    }

    fn reserve_version(&self, entry_id: &str) -> Result<u32, VersionError> {
        let max_attempts = self.policy.max_conflict_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.versions.increment(entry_id) {
                Err(VersionError::Conflict { .. }) if attempt < max_attempts => {
                    warn!(
                        "event=extraction_version module=service status=retry entry_id={entry_id} attempt={attempt}"
                    );
                    attempt += 1;
                }
                Err(VersionError::Conflict { entry_id, .. }) => {
                    return Err(VersionError::Conflict {
                        entry_id,
                        attempts: attempt,
                    });
                }
                other => return other,
            }
        }
    }

    fn extract_and_save(&self, entry_id: &str, text: &str, version: u32) -> EditOutcome {
        let drafts = match self.extractor.extract(entry_id, text) {
            Ok(drafts) => drafts,
            Err(err) => return extraction_failed(entry_id, version, err.message),
        };

        match self
            .signals
            .save_with_version_check(&drafts, entry_id, version)
        {
            Ok(outcome) => match outcome.superseded_by {
                Some(newest) => EditOutcome::Superseded { version, newest },
                None => EditOutcome::Extracted {
                    version,
                    written: outcome.written.len(),
                    deleted: outcome.deleted,
                },
            },
            Err(err) => extraction_failed(entry_id, version, err.to_string()),
        }
    }
}

fn extraction_failed(entry_id: &str, version: u32, error: String) -> EditOutcome {
    warn!(
        "event=signal_extraction module=service status=error entry_id={} version={} error={}",
        entry_id,
        version,
        truncate_single_line(&error, 160)
    );
    EditOutcome::ExtractionFailed { version, error }
}

/// Background failure report from `BackgroundEnrichment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentFailure {
    pub entry_id: String,
    pub error: String,
}

/// Failure reports kept when nobody drains `failures()`.
pub const DEFAULT_FAILURE_BACKLOG: usize = 64;

/// Runs `EditPipeline` work on worker threads.
///
/// Enrichment is best-effort: callers get a join handle they may ignore, and
/// failures (version errors included) arrive on `failures()`. The channel is
/// bounded; once full, further failures are only logged.
pub struct BackgroundEnrichment {
    pipeline: Arc<EditPipeline>,
    failures_tx: Sender<EnrichmentFailure>,
    failures_rx: Receiver<EnrichmentFailure>,
}

impl BackgroundEnrichment {
    pub fn new(pipeline: Arc<EditPipeline>) -> Self {
        Self::with_backlog(pipeline, DEFAULT_FAILURE_BACKLOG)
    }

    pub fn with_backlog(pipeline: Arc<EditPipeline>, backlog: usize) -> Self {
        let (failures_tx, failures_rx) = crossbeam_channel::bounded(backlog.max(1));
        Self {
            pipeline,
            failures_tx,
            failures_rx,
        }
    }

    /// Receiver for failures of spawned runs.
    pub fn failures(&self) -> Receiver<EnrichmentFailure> {
        self.failures_rx.clone()
    }

    pub fn spawn_saved(&self, entry_id: String, text: String) -> JoinHandle<EditOutcome> {
        self.spawn(entry_id, move |pipeline, id| pipeline.on_entry_saved(id, &text))
    }

    pub fn spawn_edited(
        &self,
        entry_id: String,
        old_text: String,
        new_text: String,
    ) -> JoinHandle<EditOutcome> {
        self.spawn(entry_id, move |pipeline, id| {
            pipeline.on_entry_edited(id, &old_text, &new_text)
        })
    }

    fn spawn(
        &self,
        entry_id: String,
        run: impl FnOnce(&EditPipeline, &str) -> Result<EditOutcome, VersionError> + Send + 'static,
    ) -> JoinHandle<EditOutcome> {
        let pipeline = Arc::clone(&self.pipeline);
        let failures = self.failures_tx.clone();
        std::thread::spawn(move || {
            let outcome = match run(&pipeline, &entry_id) {
                Ok(outcome) => outcome,
                Err(err) => {
                    let error = err.to_string();
                    warn!(
                        "event=background_enrichment module=service status=error entry_id={entry_id} error={error}"
                    );
                    report_failure(&failures, entry_id, error.clone());
                    return EditOutcome::ExtractionFailed { version: 0, error };
                }
            };
            if let EditOutcome::ExtractionFailed { error, .. } = &outcome {
                report_failure(&failures, entry_id, error.clone());
            }
            outcome
        })
    }
}

fn report_failure(failures: &Sender<EnrichmentFailure>, entry_id: String, error: String) {
    match failures.try_send(EnrichmentFailure { entry_id, error }) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(dropped)) => warn!(
            "event=background_enrichment module=service status=dropped reason=backlog_full entry_id={}",
            dropped.entry_id
        ),
    }
}
