//! Offline queue synchronization.
//!
//! # Responsibility
//! - `orchestrator`: sequential queue drain with retry cap and backoff.
//! - `backoff`: delay curve and jitter.
//! - `events`: lifecycle events and subscriptions.
//! - `submit`: contract for the injected remote submission.

pub mod backoff;
pub mod events;
pub mod orchestrator;
pub mod submit;

pub use backoff::Backoff;
pub use events::{EventBus, Subscription, SyncEvent, SyncReport};
pub use orchestrator::{AttemptOutcome, Sleeper, SyncOptions, SyncOrchestrator, ThreadSleeper};
pub use submit::{RecordSubmitter, SubmitError, SubmitReceipt};
