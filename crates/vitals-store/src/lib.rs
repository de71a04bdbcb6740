//! Data persistence for the vitals pipeline.
//!
//! One SQLite database backs three distinct concerns, kept behind separate
//! abstractions because their failure semantics differ:
//!
//! - the **hot store** ([`Store`]): low-latency sample rows with idempotent
//!   upsert, plus the partition enumeration the archival engine walks;
//! - the **state store** ([`StateStore`]): durable worker continuation state
//!   (sync cursors, backfill progress, rotation cursor, archive metrics)
//!   that must never be silently lost;
//! - **run locks** ([`LockStore`], [`fail_open_acquire`]): advisory TTL
//!   locks that reduce duplicate work and are allowed to fail open.

pub mod error;
pub mod lock;
pub mod schema;
pub mod state;
pub mod store;

pub use error::{Error, Result};
pub use lock::{LockStore, fail_open_acquire};
pub use state::{StateStore, keys};
pub use store::{Store, UpsertOutcome};
