//! Extraction version counter for entries.
//!
//! # Responsibility
//! - Hand out the next extraction version for an entry.
//!
//! # Invariants
//! - The increment is a single optimistic transaction on the entry document:
//!   two concurrent increments never yield the same version.
//! - A conflict is returned to the caller, never swallowed.

use crate::repo::document_store::{DocumentStore, StoreError};
use log::info;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub const ENTRIES_COLLECTION: &str = "entries";
pub const EXTRACTION_VERSION_FIELD: &str = "extractionVersion";

#[derive(Debug)]
pub enum VersionError {
    Store(StoreError),
    EntryNotFound(String),
    /// Another writer moved the entry between read and write.
    Conflict { entry_id: String, attempts: u32 },
}

impl Display for VersionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::EntryNotFound(id) => write!(f, "entry not found: {id}"),
            Self::Conflict { entry_id, attempts } => write!(
                f,
                "extraction version of entry {entry_id} changed concurrently ({attempts} attempts)"
            ),
        }
    }
}

impl Error for VersionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for VersionError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound { id, .. } => Self::EntryNotFound(id),
            StoreError::Conflict { id, .. } => Self::Conflict {
                entry_id: id,
                attempts: 1,
            },
            other => Self::Store(other),
        }
    }
}

/// Reads and increments per-entry extraction versions.
#[derive(Clone)]
pub struct VersionCounter {
    store: Arc<dyn DocumentStore>,
}

impl VersionCounter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Latest version handed out for `entry_id`; `0` before the first run.
    pub fn current(&self, entry_id: &str) -> Result<u32, VersionError> {
        let document = self
            .store
            .get(ENTRIES_COLLECTION, entry_id)?
            .ok_or_else(|| VersionError::EntryNotFound(entry_id.to_string()))?;
        Ok(read_version(&document.data))
    }

    /// Atomically moves the entry to its next extraction version.
    ///
    /// # Errors
    /// - `EntryNotFound` when the entry document does not exist.
    /// - `Conflict` when another writer touched the entry concurrently.
    pub fn increment(&self, entry_id: &str) -> Result<u32, VersionError> {
        let written = self
            .store
            .transact(ENTRIES_COLLECTION, entry_id, &mut |current| {
                let Some(existing) = current.filter(|value| value.is_object()) else {
                    return Err(StoreError::NotFound {
                        collection: ENTRIES_COLLECTION.to_string(),
                        id: entry_id.to_string(),
                    });
                };
                let mut updated = existing.clone();
                updated[EXTRACTION_VERSION_FIELD] = Value::from(read_version(existing) + 1);
                Ok(updated)
            })?;

        let version = read_version(&written);
        info!("event=extraction_version module=service status=ok entry_id={entry_id} version={version}");
        Ok(version)
    }
}

fn read_version(data: &Value) -> u32 {
    data.get(EXTRACTION_VERSION_FIELD)
        .and_then(Value::as_u64)
        .and_then(|version| u32::try_from(version).ok())
        .unwrap_or(0)
}
