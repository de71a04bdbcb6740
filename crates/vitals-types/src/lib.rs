//! Shared types for the vitals ingestion pipeline.
//!
//! This crate holds the data model used across the workers: normalized
//! samples, per-site sync cursors, the backfill continuation state machine,
//! archival partition keys, and freshness classification. It carries no I/O
//! so the store, client, and service crates can all depend on it.

pub mod backfill;
pub mod error;
pub mod partition;
pub mod types;

pub use backfill::{BackfillState, BackfillStatus};
pub use error::{StateError, StateResult};
pub use partition::PartitionKey;
pub use types::{Freshness, Sample, SyncState, ms_to_rfc3339, rfc3339_to_ms};
