//! Core use-case services.
//!
//! # Responsibility
//! - Derived-signal workflow: change detection, version reservation,
//!   versioned persistence.
//! - Day score aggregation over entries and signals.
//!
//! # Invariants
//! - Services depend on `DocumentStore`, never on SQL.

pub mod change_detector;
pub mod day_score;
pub mod edit_pipeline;
pub mod extraction_version;
pub mod signal_store;
