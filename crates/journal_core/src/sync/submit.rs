//! Remote submission contract injected into the orchestrator.

use crate::model::queued_record::QueuedRecord;
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Successful submission response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitReceipt {
    /// Server-assigned id; a missing or blank id counts as failure.
    pub id: Option<String>,
    /// Anything the server derived from the entry (analysis results etc.).
    pub derived: Option<Value>,
}

impl SubmitReceipt {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            derived: None,
        }
    }
}

/// Submission failure. Every failure is retried the same way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitError {
    pub message: String,
}

impl SubmitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for SubmitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for SubmitError {}

/// Performs the network submission of one queued record.
pub trait RecordSubmitter {
    fn submit(&self, record: &QueuedRecord) -> Result<SubmitReceipt, SubmitError>;
}

impl<F> RecordSubmitter for F
where
    F: Fn(&QueuedRecord) -> Result<SubmitReceipt, SubmitError>,
{
    fn submit(&self, record: &QueuedRecord) -> Result<SubmitReceipt, SubmitError> {
        self(record)
    }
}
