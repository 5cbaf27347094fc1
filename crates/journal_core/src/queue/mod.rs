//! Device-local offline queue.
//!
//! # Responsibility
//! - Hold entries captured offline until the sync orchestrator submits them.
//!
//! # Invariants
//! - The queue is never shared between devices or processes.

pub mod local_queue;

pub use local_queue::{
    FailureMark, LocalQueue, QueueError, QueueMeta, QueueResult, QueueStats, QUEUE_KEY,
    QUEUE_META_KEY,
};
