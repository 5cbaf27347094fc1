//! Durable offline queue over key/value persistence.
//!
//! # Responsibility
//! - Persist queued records as one serialized collection.
//! - Apply lifecycle transitions driven by the sync orchestrator.
//!
//! # Invariants
//! - A corrupt or missing collection reads as empty; the parse failure is
//!   logged and the next write replaces it.
//! - Records keep insertion order, so listings are oldest-first.
//! - `mark_failed` increments `retry_count`; reaching the cap moves the record
//!   to `failed`, otherwise it returns to `pending`.
//! - Read-modify-write cycles are serialized by `write_lock`.

use crate::model::now_epoch_ms;
use crate::model::queued_record::{
    EntryDraft, LocalId, QueueState, QueuedRecord, SyncStatus,
};
use crate::repo::kv_store::{KeyValueStore, KvError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, PoisonError};

/// Key holding the serialized `QueuedRecord` collection.
pub const QUEUE_KEY: &str = "journal.offline_queue.v1";
/// Key holding `QueueMeta`.
pub const QUEUE_META_KEY: &str = "journal.offline_queue.meta.v1";

pub type QueueResult<T> = Result<T, QueueError>;

/// Queue write/transition error. Reads never fail on bad data.
#[derive(Debug)]
pub enum QueueError {
    Storage(KvError),
    Serialization(serde_json::Error),
    NotFound(LocalId),
    InvalidTransition {
        local_id: LocalId,
        from: SyncStatus,
        action: &'static str,
    },
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "queue serialization failed: {err}"),
            Self::NotFound(id) => write!(f, "queued record not found: {id}"),
            Self::InvalidTransition {
                local_id,
                from,
                action,
            } => write!(f, "cannot {action} record {local_id} while {from}"),
        }
    }
}

impl Error for QueueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KvError> for QueueError {
    fn from(value: KvError) -> Self {
        Self::Storage(value)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Per-status record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
    /// `created_at_ms` of the oldest pending record.
    pub oldest_pending_at_ms: Option<i64>,
}

/// Small bookkeeping record stored next to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueMeta {
    pub last_sync_started_at_ms: Option<i64>,
    pub last_sync_completed_at_ms: Option<i64>,
    pub last_synced_count: usize,
    pub last_failed_count: usize,
}

/// Outcome of `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureMark {
    /// Retry count after the increment.
    pub retry_count: u32,
    /// `true` when the record reached the cap and is now `failed`.
    pub exhausted: bool,
}

/// Device-local durable queue.
pub struct LocalQueue<K: KeyValueStore> {
    store: K,
    max_retries: u32,
    write_lock: Mutex<()>,
}

impl<K: KeyValueStore> LocalQueue<K> {
    /// Creates a queue whose records become `failed` after `max_retries`
    /// failed submissions.
    pub fn new(store: K, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Appends a new pending record.
    pub fn enqueue(&self, payload: EntryDraft) -> QueueResult<QueuedRecord> {
        let record = QueuedRecord::new(payload, now_epoch_ms());
        let created = record.clone();
        self.mutate(|records| {
            records.push(record);
            Ok(())
        })?;
        info!(
            "event=queue_enqueue module=queue status=ok local_id={}",
            created.local_id
        );
        Ok(created)
    }

    /// Applies `patch` to one record. Returns `false` when the id is unknown.
    pub fn update(
        &self,
        local_id: LocalId,
        patch: impl FnOnce(&mut QueuedRecord),
    ) -> QueueResult<bool> {
        self.mutate(|records| {
            Ok(match records.iter_mut().find(|r| r.local_id == local_id) {
                Some(record) => {
                    patch(record);
                    true
                }
                None => false,
            })
        })
    }

    /// Removes one record. Returns `false` when the id is unknown.
    pub fn remove(&self, local_id: LocalId) -> QueueResult<bool> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.local_id != local_id);
            Ok(records.len() != before)
        })
    }

    pub fn get(&self, local_id: LocalId) -> Option<QueuedRecord> {
        self.load().into_iter().find(|r| r.local_id == local_id)
    }

    /// All records, oldest first.
    pub fn list_all(&self) -> Vec<QueuedRecord> {
        self.load()
    }

    /// Pending records with `retry_count < max_retries`, oldest first.
    pub fn list_pending(&self, max_retries: u32) -> Vec<QueuedRecord> {
        self.load()
            .into_iter()
            .filter(|r| r.status() == SyncStatus::Pending && r.retry_count < max_retries)
            .collect()
    }

    pub fn list_failed(&self) -> Vec<QueuedRecord> {
        self.load()
            .into_iter()
            .filter(|r| r.status() == SyncStatus::Failed)
            .collect()
    }

    /// Number of records not yet synced; backs the "working offline" badge.
    pub fn pending_count(&self) -> usize {
        self.load()
            .iter()
            .filter(|r| matches!(r.status(), SyncStatus::Pending | SyncStatus::Syncing))
            .count()
    }

    /// `pending → syncing`, stamping `last_attempt_at_ms`.
    pub fn mark_syncing(&self, local_id: LocalId) -> QueueResult<()> {
        self.transition(local_id, "mark syncing", |record| {
            if record.state != QueueState::Pending {
                return Err(record.status());
            }
            record.state = QueueState::Syncing;
            record.last_attempt_at_ms = Some(now_epoch_ms());
            Ok(())
        })
    }

    /// `pending|syncing → synced` with the server-assigned id.
    pub fn mark_synced(
        &self,
        local_id: LocalId,
        remote_id: impl Into<String>,
        server_derived: Option<Value>,
    ) -> QueueResult<()> {
        let remote_id = remote_id.into();
        self.transition(local_id, "mark synced", move |record| {
            if !matches!(record.state, QueueState::Pending | QueueState::Syncing) {
                return Err(record.status());
            }
            record.state = QueueState::Synced {
                remote_id,
                server_derived,
            };
            record.last_error = None;
            Ok(())
        })
    }

    /// Records a failed submission attempt.
    pub fn mark_failed(
        &self,
        local_id: LocalId,
        error_message: impl Into<String>,
    ) -> QueueResult<FailureMark> {
        let error_message = error_message.into();
        let max_retries = self.max_retries;
        let mut mark = None;
        self.transition(local_id, "mark failed", |record| {
            if !matches!(record.state, QueueState::Pending | QueueState::Syncing) {
                return Err(record.status());
            }
            record.retry_count = record.retry_count.saturating_add(1);
            record.last_error = Some(error_message);
            record.last_attempt_at_ms = Some(now_epoch_ms());
            let exhausted = record.retry_count >= max_retries;
            record.state = if exhausted {
                QueueState::Failed
            } else {
                QueueState::Pending
            };
            mark = Some(FailureMark {
                retry_count: record.retry_count,
                exhausted,
            });
            Ok(())
        })?;
        mark.ok_or(QueueError::NotFound(local_id))
    }

    /// Manual retry: resets the retry budget and returns the record to
    /// `pending`. Synced and in-flight records are left alone.
    pub fn reset_for_retry(&self, local_id: LocalId) -> QueueResult<()> {
        self.transition(local_id, "reset for retry", |record| {
            if !matches!(record.state, QueueState::Pending | QueueState::Failed) {
                return Err(record.status());
            }
            record.state = QueueState::Pending;
            record.retry_count = 0;
            record.last_error = None;
            Ok(())
        })
    }

    /// Returns records stuck in `syncing` (the process stopped mid-submit) to
    /// `pending`. Returns how many were recovered.
    pub fn recover_interrupted(&self) -> QueueResult<usize> {
        let recovered = self.mutate(|records| {
            let mut count = 0;
            for record in records.iter_mut().filter(|r| r.state == QueueState::Syncing) {
                record.state = QueueState::Pending;
                count += 1;
            }
            Ok(count)
        })?;
        if recovered > 0 {
            warn!("event=queue_recover module=queue status=ok recovered={recovered}");
        }
        Ok(recovered)
    }

    /// Drops synced records. Returns how many were removed.
    pub fn clear_synced(&self) -> QueueResult<usize> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.status() != SyncStatus::Synced);
            Ok(before - records.len())
        })
    }

    pub fn stats(&self) -> QueueStats {
        let records = self.load();
        let mut stats = QueueStats {
            total: records.len(),
            ..QueueStats::default()
        };
        for record in &records {
            match record.status() {
                SyncStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_at_ms = Some(
                        stats
                            .oldest_pending_at_ms
                            .map_or(record.created_at_ms, |t| t.min(record.created_at_ms)),
                    );
                }
                SyncStatus::Syncing => stats.syncing += 1,
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn meta(&self) -> QueueMeta {
        self.read_json(QUEUE_META_KEY).unwrap_or_default()
    }

    pub fn set_meta(&self, meta: &QueueMeta) -> QueueResult<()> {
        self.store.set(QUEUE_META_KEY, &serde_json::to_string(meta)?)?;
        Ok(())
    }

    fn transition(
        &self,
        local_id: LocalId,
        action: &'static str,
        apply: impl FnOnce(&mut QueuedRecord) -> Result<(), SyncStatus>,
    ) -> QueueResult<()> {
        self.mutate(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.local_id == local_id)
                .ok_or(QueueError::NotFound(local_id))?;
            apply(record).map_err(|from| QueueError::InvalidTransition {
                local_id,
                from,
                action,
            })
        })
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Vec<QueuedRecord>) -> QueueResult<T>,
    ) -> QueueResult<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.load();
        let result = change(&mut records)?;
        self.store.set(QUEUE_KEY, &serde_json::to_string(&records)?)?;
        Ok(result)
    }

    fn load(&self) -> Vec<QueuedRecord> {
        self.read_json(QUEUE_KEY).unwrap_or_default()
    }

    /// Fail-open read: storage and parse errors yield `None`.
    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.store.get(key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!("event=queue_read module=queue status=error key={key} error={err}");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    "event=queue_read module=queue status=corrupt key={key} bytes={} error={err}",
                    raw.len()
                );
                None
            }
        }
    }
}
