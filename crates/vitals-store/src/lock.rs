//! Advisory TTL run locks.
//!
//! Locks only reduce wasted duplicate work; they provide no exclusivity
//! guarantee. Correctness downstream comes from idempotent writes, which is
//! why acquisition fails open when the lock store itself misbehaves.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{Store, now_ms};

/// TTL-bounded lock records.
pub trait LockStore {
    /// Try to take the lock. Returns `true` iff no unexpired record exists
    /// for `key`; on success a record with `expires_at = now + ttl` is
    /// written.
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lock record. Succeeds if absent.
    fn release(&self, key: &str) -> Result<()>;
}

impl LockStore for Store {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();

        // Expired records are garbage; reap before attempting the insert so
        // a crashed holder never blocks past its TTL.
        self.conn().execute(
            "DELETE FROM locks WHERE key = ?1 AND expires_at <= ?2",
            rusqlite::params![key, now],
        )?;

        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO locks (key, acquired_at, expires_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, now, now + ttl.as_millis() as i64],
        )?;

        debug!("lock {}: acquired={}", key, inserted == 1);
        Ok(inserted == 1)
    }

    fn release(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM locks WHERE key = ?", [key])?;
        Ok(())
    }
}

/// Acquire with fail-open semantics.
///
/// A lock-store error yields `true` (proceed) with a warning: a stalled
/// pipeline is worse than occasional duplicate work, and the duplicate work
/// is harmless because every downstream write is an idempotent upsert.
pub fn fail_open_acquire<L: LockStore + ?Sized>(locks: &L, key: &str, ttl: Duration) -> bool {
    match locks.try_acquire(key, ttl) {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!("lock store error for {}, proceeding without lock: {}", key, e);
            true
        }
    }
}
