//! Persistence contracts and SQLite implementations.
//!
//! # Responsibility
//! - `kv_store`: device-local key/value persistence for the offline queue.
//! - `document_store`: transactional document store used for entries,
//!   signals and cached day summaries.
//!
//! # Invariants
//! - SQL stays inside this module; callers only see traits and typed errors.

pub mod document_store;
pub mod kv_store;
