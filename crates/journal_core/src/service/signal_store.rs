//! Version-controlled signal persistence.
//!
//! # Responsibility
//! - Write extraction output tagged with its extraction version.
//! - Delete signals from older extraction runs in the same atomic batch.
//! - Apply user review transitions (`verify`, `dismiss`).
//!
//! # Invariants
//! - After `save_with_version_check(.., v)` no signal with version `< v`
//!   remains for that source entry.
//! - A save older than what the store already holds writes nothing, even
//!   when the two saves overlap: the newest-version read and the batch are
//!   tied together by a revision check on the entry's version marker.
//! - `Verified` and `Dismissed` are terminal.

use crate::model::now_epoch_ms;
use crate::model::signal::{Signal, SignalDraft, SignalStatus};
use crate::repo::document_store::{DocumentStore, StoreError, WriteOp};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

pub const SIGNALS_COLLECTION: &str = "signals";
/// Per-entry marker holding the newest saved extraction version.
pub const SIGNAL_SOURCES_COLLECTION: &str = "signal_sources";

const LATEST_VERSION_FIELD: &str = "latestVersion";
const MAX_SAVE_ATTEMPTS: u32 = 5;

pub type SignalResult<T> = Result<T, SignalStoreError>;

#[derive(Debug)]
pub enum SignalStoreError {
    Store(StoreError),
    NotFound(String),
    /// Extraction versions start at 1.
    InvalidVersion(u32),
    InvalidTransition {
        signal_id: String,
        from: SignalStatus,
        to: SignalStatus,
    },
}

impl Display for SignalStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "signal not found: {id}"),
            Self::InvalidVersion(version) => write!(f, "invalid extraction version {version}"),
            Self::InvalidTransition {
                signal_id,
                from,
                to,
            } => write!(f, "signal {signal_id} cannot move from {from} to {to}"),
        }
    }
}

impl Error for SignalStoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for SignalStoreError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound { id, .. } => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Result of one versioned save.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub written: Vec<Signal>,
    /// Stale signals removed by this save.
    pub deleted: usize,
    /// Set when the store already held a newer version; nothing was written.
    pub superseded_by: Option<u32>,
}

/// Signal repository with extraction-version supersession.
#[derive(Clone)]
pub struct SignalStore {
    store: Arc<dyn DocumentStore>,
}

impl SignalStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Replaces older-version signals of `source_record_id` with `drafts`.
    ///
    /// Deletes and writes are committed as one batch, guarded by the revision
    /// of the entry's version marker; a concurrent save makes this one re-read
    /// and re-decide, up to `MAX_SAVE_ATTEMPTS` times.
    pub fn save_with_version_check(
        &self,
        drafts: &[SignalDraft],
        source_record_id: &str,
        version: u32,
    ) -> SignalResult<SaveOutcome> {
        if version == 0 {
            return Err(SignalStoreError::InvalidVersion(version));
        }

        let mut attempt = 1;
        loop {
            match self.try_save(drafts, source_record_id, version) {
                Err(SignalStoreError::Store(StoreError::Conflict { .. }))
                    if attempt < MAX_SAVE_ATTEMPTS =>
                {
                    warn!(
                        "event=signal_save module=service status=retry source_id={} version={} attempt={}",
                        source_record_id, version, attempt
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn try_save(
        &self,
        drafts: &[SignalDraft],
        source_record_id: &str,
        version: u32,
    ) -> SignalResult<SaveOutcome> {
        // The marker is read before the signals: any save committing after
        // this point bumps its revision and fails the `Check` below.
        let marker = self.store.get(SIGNAL_SOURCES_COLLECTION, source_record_id)?;
        let existing = self.signals_for_record(source_record_id)?;
        let newest = existing
            .iter()
            .map(|s| s.extraction_version)
            .max()
            .unwrap_or(0)
            .max(marker.as_ref().map_or(0, |doc| read_latest_version(&doc.data)));
        if newest > version {
            warn!(
                "event=signal_save module=service status=skipped reason=superseded source_id={} version={} newest={}",
                source_record_id, version, newest
            );
            return Ok(SaveOutcome {
                written: Vec::new(),
                deleted: 0,
                superseded_by: Some(newest),
            });
        }

        let mut ops = vec![WriteOp::Check {
            collection: SIGNAL_SOURCES_COLLECTION.to_string(),
            id: source_record_id.to_string(),
            revision: marker.as_ref().map(|doc| doc.revision),
        }];
        ops.extend(
            existing
                .iter()
                .filter(|signal| signal.extraction_version < version)
                .map(|signal| WriteOp::Delete {
                    collection: SIGNALS_COLLECTION.to_string(),
                    id: signal.id.clone(),
                }),
        );
        let deleted = ops.len() - 1;

        let now = now_epoch_ms();
        let written: Vec<Signal> = drafts
            .iter()
            .map(|draft| Signal {
                id: Uuid::new_v4().to_string(),
                source_record_id: source_record_id.to_string(),
                extraction_version: version,
                target_date: draft.target_date.clone(),
                kind: draft.kind,
                content: draft.content.clone(),
                sentiment: draft.sentiment,
                confidence: draft.confidence.clamp(0.0, 1.0),
                status: SignalStatus::Active,
                created_at_ms: now,
                updated_at_ms: now,
            })
            .collect();
        for signal in &written {
            ops.push(WriteOp::Set {
                collection: SIGNALS_COLLECTION.to_string(),
                id: signal.id.clone(),
                data: serde_json::to_value(signal).map_err(StoreError::from)?,
            });
        }
        ops.push(WriteOp::Set {
            collection: SIGNAL_SOURCES_COLLECTION.to_string(),
            id: source_record_id.to_string(),
            data: json!({
                "sourceRecordId": source_record_id,
                LATEST_VERSION_FIELD: version,
            }),
        });

        self.store.commit_batch(&ops)?;
        info!(
            "event=signal_save module=service status=ok source_id={} version={} written={} deleted={}",
            source_record_id,
            version,
            written.len(),
            deleted
        );
        Ok(SaveOutcome {
            written,
            deleted,
            superseded_by: None,
        })
    }

    /// All signals extracted from one entry, oldest version first.
    pub fn signals_for_record(&self, source_record_id: &str) -> SignalResult<Vec<Signal>> {
        let mut signals = self.query("sourceRecordId", source_record_id)?;
        signals.sort_by(|a, b| {
            a.extraction_version
                .cmp(&b.extraction_version)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
        });
        Ok(signals)
    }

    /// All signals targeting one calendar day (`YYYY-MM-DD`).
    pub fn signals_for_date(&self, date_key: &str) -> SignalResult<Vec<Signal>> {
        self.query("targetDate", date_key)
    }

    pub fn get(&self, signal_id: &str) -> SignalResult<Option<Signal>> {
        self.store
            .get(SIGNALS_COLLECTION, signal_id)?
            .map(|document| document.decode::<Signal>())
            .transpose()
            .map_err(SignalStoreError::from)
    }

    /// Moves one signal from `active` to `status`.
    ///
    /// Repeating the transition a signal already made is a no-op.
    pub fn update_status(&self, signal_id: &str, status: SignalStatus) -> SignalResult<Signal> {
        ensure_review_target(signal_id, status)?;

        let mut rejected = None;
        let written = self
            .store
            .transact(SIGNALS_COLLECTION, signal_id, &mut |current| {
                let current = current.ok_or_else(|| StoreError::NotFound {
                    collection: SIGNALS_COLLECTION.to_string(),
                    id: signal_id.to_string(),
                })?;
                let mut signal = decode_signal(current)?;
                if signal.status != SignalStatus::Active && signal.status != status {
                    rejected = Some(signal.status);
                    return Err(StoreError::Aborted("terminal signal status".to_string()));
                }
                signal.status = status;
                signal.updated_at_ms = now_epoch_ms();
                Ok(serde_json::to_value(&signal)?)
            });

        match (written, rejected) {
            (_, Some(from)) => Err(SignalStoreError::InvalidTransition {
                signal_id: signal_id.to_string(),
                from,
                to: status,
            }),
            (Ok(value), None) => Ok(decode_signal(&value)?),
            (Err(err), None) => Err(err.into()),
        }
    }

    /// Applies one review transition to many signals atomically.
    ///
    /// Validates every signal first; one invalid id or transition rejects the
    /// whole batch. Returns how many signals changed.
    pub fn batch_update_status(
        &self,
        signal_ids: &[String],
        status: SignalStatus,
    ) -> SignalResult<usize> {
        let mut ops = Vec::new();
        let now = now_epoch_ms();
        for signal_id in signal_ids {
            ensure_review_target(signal_id, status)?;
            let signal = self
                .get(signal_id)?
                .ok_or_else(|| SignalStoreError::NotFound(signal_id.clone()))?;
            if signal.status == status {
                continue;
            }
            if signal.status.is_terminal() {
                return Err(SignalStoreError::InvalidTransition {
                    signal_id: signal_id.clone(),
                    from: signal.status,
                    to: status,
                });
            }

            let mut patch = Map::new();
            patch.insert("status".to_string(), Value::from(status.as_str()));
            patch.insert("updatedAtMs".to_string(), Value::from(now));
            ops.push(WriteOp::Merge {
                collection: SIGNALS_COLLECTION.to_string(),
                id: signal_id.clone(),
                patch,
            });
        }

        self.store.commit_batch(&ops)?;
        info!(
            "event=signal_review module=service status=ok target={} requested={} changed={}",
            status,
            signal_ids.len(),
            ops.len()
        );
        Ok(ops.len())
    }

    fn query(&self, field: &str, value: &str) -> SignalResult<Vec<Signal>> {
        self.store
            .query_eq(SIGNALS_COLLECTION, field, &Value::from(value))?
            .iter()
            .map(|document| document.decode::<Signal>().map_err(SignalStoreError::from))
            .collect()
    }
}

fn read_latest_version(data: &Value) -> u32 {
    data.get(LATEST_VERSION_FIELD)
        .and_then(Value::as_u64)
        .and_then(|version| u32::try_from(version).ok())
        .unwrap_or(0)
}

fn decode_signal(value: &Value) -> Result<Signal, StoreError> {
    Ok(Signal::deserialize(value)?)
}

fn ensure_review_target(signal_id: &str, status: SignalStatus) -> SignalResult<()> {
    if status.is_terminal() {
        return Ok(());
    }
    Err(SignalStoreError::InvalidTransition {
        signal_id: signal_id.to_string(),
        from: SignalStatus::Active,
        to: status,
    })
}
