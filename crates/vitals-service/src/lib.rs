//! Ingestion workers and HTTP control surface for the vitals pipeline.
//!
//! Three workers share one [`AppState`] and never the same state-store keys:
//!
//! - [`SyncOrchestrator`] keeps the hot store current: per invocation it
//!   takes an advisory run lock, picks a bounded batch of sites (worst lag
//!   first, round-robin for the rest), fetches each site's incremental
//!   window page by page, upserts, and advances the per-site sync cursor to
//!   the newest timestamp actually written. A bounded catch-up loop repeats
//!   cycles while freshness lag stays above target.
//! - [`BackfillEngine`] walks a fixed historical date range day by day and
//!   page by page, persisting its position after every page so any
//!   invocation boundary (or crash) resumes at the exact cursor.
//! - [`ArchivalEngine`] migrates aged partitions into compressed Parquet
//!   objects in cold storage, verifying each upload before deleting the hot
//!   rows.
//!
//! Every worker is a plain `run()`-style method; the HTTP router and the
//! CLI subcommands are thin adapters over the same entry points, so the
//! core logic stays platform-agnostic and unit-testable.

pub mod api;
pub mod archive;
pub mod backfill;
pub mod config;
pub mod freshness;
pub mod state;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use archive::{ArchivalEngine, ArchiveReport};
pub use backfill::{BackfillEngine, BackfillError, TriggerOutcome};
pub use config::{
    ApiConfig, ArchiveConfig, BackfillConfig, Config, ConfigError, ServerConfig, StorageConfig,
    SyncConfig,
};
pub use freshness::FreshnessMonitor;
pub use state::AppState;
pub use sync::{SiteSyncResult, SyncOrchestrator, SyncReport};
