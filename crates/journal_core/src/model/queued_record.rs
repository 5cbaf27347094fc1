//! Offline queue record model.
//!
//! # Responsibility
//! - Carry an entry draft from offline capture to remote submission.
//! - Encode the sync lifecycle so illegal field combinations cannot be built.
//!
//! # Invariants
//! - `local_id` is generated once and never reused.
//! - `remote_id` only exists inside `QueueState::Synced`.
//! - `retry_count` only grows, except through an explicit manual retry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Device-local identifier of a queued record.
pub type LocalId = Uuid;

/// Journal entry projection kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Free-form journal text.
    Journal,
    /// Actionable task; excluded from mood averages.
    Task,
}

/// Entry content captured while offline.
///
/// `local_analysis` and `attachments` are opaque to the core and are handed to
/// the submitter untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDraft {
    pub content: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_analysis: Option<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attachments: Map<String, Value>,
}

impl EntryDraft {
    pub fn journal(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: EntryKind::Journal,
            mood_score: None,
            local_analysis: None,
            attachments: Map::new(),
        }
    }
}

/// Flat status label, used for filtering, stats and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a queued record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "syncStatus", rename_all = "snake_case")]
pub enum QueueState {
    /// Waiting for the next sync pass.
    Pending,
    /// A submission is in flight.
    Syncing,
    /// Accepted by the remote service.
    Synced {
        #[serde(rename = "remoteId")]
        remote_id: String,
        #[serde(
            rename = "serverDerived",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        server_derived: Option<Value>,
    },
    /// Retry cap reached; waits for a manual retry or discard.
    Failed,
}

impl QueueState {
    pub fn status(&self) -> SyncStatus {
        match self {
            Self::Pending => SyncStatus::Pending,
            Self::Syncing => SyncStatus::Syncing,
            Self::Synced { .. } => SyncStatus::Synced,
            Self::Failed => SyncStatus::Failed,
        }
    }
}

/// One entry held in the device-local queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRecord {
    pub local_id: LocalId,
    pub payload: EntryDraft,
    /// Epoch milliseconds at enqueue time.
    pub created_at_ms: i64,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt_at_ms: Option<i64>,
    #[serde(flatten)]
    pub state: QueueState,
}

impl QueuedRecord {
    /// Creates a pending record with a fresh local id.
    pub fn new(payload: EntryDraft, created_at_ms: i64) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            payload,
            created_at_ms,
            retry_count: 0,
            last_error: None,
            last_attempt_at_ms: None,
            state: QueueState::Pending,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status()
    }

    /// Remote id assigned by the server; `Some` only when synced.
    pub fn remote_id(&self) -> Option<&str> {
        match &self.state {
            QueueState::Synced { remote_id, .. } => Some(remote_id.as_str()),
            _ => None,
        }
    }
}
