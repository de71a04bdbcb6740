//! Durable worker state.
//!
//! Continuation state lives in a small kv table so every worker invocation
//! can resume from wherever the previous one stopped. Unlike the run locks,
//! nothing here may be silently lost; errors propagate to the caller.

use tracing::debug;

use vitals_types::{BackfillState, SyncState};

use crate::error::Result;
use crate::store::{Store, now_ms};

/// Key layout for the state store.
pub mod keys {
    /// Round-robin site rotation cursor for the sync orchestrator.
    pub const SYNC_ROTATION: &str = "sync:rotation";

    /// Per-site incremental sync cursor.
    pub fn sync_last_sync(site: &str) -> String {
        format!("sync:last_sync:{site}")
    }

    /// Per-site backfill continuation blob.
    pub fn backfill(site: &str) -> String {
        format!("backfill:{site}")
    }

    /// Run lock for a worker scope.
    pub fn lock(scope: &str) -> String {
        format!("lock:{scope}")
    }

    /// Metrics blob for one archival run.
    pub fn archive_metrics(run_id: &str) -> String {
        format!("archive:metrics:{run_id}")
    }
}

/// Typed access to durable worker state.
pub trait StateStore {
    /// Read a raw value.
    fn get_raw(&self, key: &str) -> Result<Option<String>>;

    /// Write a raw value.
    fn put_raw(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key; succeeds if absent.
    fn delete_raw(&self, key: &str) -> Result<()>;

    /// Incremental sync cursor for a site.
    fn sync_state(&self, site: &str) -> Result<Option<SyncState>> {
        self.get_raw(&keys::sync_last_sync(site))?
            .map(|blob| serde_json::from_str(&blob))
            .transpose()
            .map_err(Into::into)
    }

    /// Persist a sync cursor.
    fn put_sync_state(&self, state: &SyncState) -> Result<()> {
        let blob = serde_json::to_string(state)?;
        self.put_raw(&keys::sync_last_sync(&state.site), &blob)
    }

    /// Backfill continuation state for a site.
    fn backfill_state(&self, site: &str) -> Result<Option<BackfillState>> {
        self.get_raw(&keys::backfill(site))?
            .map(|blob| serde_json::from_str(&blob))
            .transpose()
            .map_err(Into::into)
    }

    /// Persist backfill state. Called after every page, not just every day,
    /// so a crash mid-day resumes at the exact cursor.
    fn put_backfill_state(&self, state: &BackfillState) -> Result<()> {
        let blob = serde_json::to_string(state)?;
        self.put_raw(&keys::backfill(&state.site), &blob)
    }

    /// Drop backfill state (explicit reset).
    fn clear_backfill_state(&self, site: &str) -> Result<()> {
        self.delete_raw(&keys::backfill(site))
    }

    /// Round-robin rotation cursor for site selection.
    fn rotation_cursor(&self) -> Result<u64> {
        Ok(self
            .get_raw(keys::SYNC_ROTATION)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Persist the rotation cursor.
    fn put_rotation_cursor(&self, cursor: u64) -> Result<()> {
        self.put_raw(keys::SYNC_ROTATION, &cursor.to_string())
    }
}

impl StateStore for Store {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;

        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![key, value, now_ms()],
        )?;
        debug!("state put: {}", key);
        Ok(())
    }

    fn delete_raw(&self, key: &str) -> Result<()> {
        self.conn().execute("DELETE FROM kv WHERE key = ?", [key])?;
        Ok(())
    }
}
