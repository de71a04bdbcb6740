//! Hot-to-cold archival engine.
//!
//! Per partition the order is fixed and never reordered: drain rows from
//! the hot store, encode one compressed Parquet buffer, upload, verify the
//! upload through a metadata read, and only then delete the hot rows. Any
//! failure before verification leaves the hot store untouched; the
//! partition is simply picked up again by the next scheduled run.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use vitals_client::RetryConfig;
use vitals_cold::encode_partition;
use vitals_store::{StateStore, keys};
use vitals_types::{PartitionKey, Sample};

use crate::state::AppState;

/// Outcome of one archival run.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    /// Unique id of this run; metrics are persisted under it.
    pub run_id: String,
    /// Partitions uploaded, verified, and deleted this run.
    pub partitions_archived: usize,
    /// Partitions whose cold object already existed (hot rows were still
    /// reaped after re-verifying the object).
    pub partitions_skipped: usize,
    /// Partitions that failed before verification and kept their hot rows.
    pub partitions_failed: usize,
    /// Rows encoded into cold objects this run.
    pub rows_archived: u64,
    /// Hot rows deleted this run.
    pub rows_deleted: u64,
    /// Compressed bytes uploaded this run.
    pub bytes_uploaded: u64,
    /// Per-partition failures.
    pub errors: Vec<String>,
    /// Wall-clock duration of the run.
    pub duration_secs: f64,
}

/// Errors inside one partition's archival.
#[derive(Debug, thiserror::Error)]
enum ArchiveError {
    #[error("store error: {0}")]
    Store(#[from] vitals_store::Error),
    #[error("cold storage error: {0}")]
    Cold(#[from] vitals_cold::Error),
    #[error("verification failed for {path}: object missing or empty after upload")]
    VerifyFailed { path: String },
}

enum PartitionOutcome {
    Archived { rows: u64, bytes: u64, deleted: u64 },
    AlreadyArchived { deleted: u64 },
}

/// Scheduled hot-to-cold migration worker.
pub struct ArchivalEngine {
    state: Arc<AppState>,
    upload_retry: RetryConfig,
}

impl ArchivalEngine {
    /// Create an engine with the configured upload retry cap.
    pub fn new(state: Arc<AppState>) -> Self {
        let upload_retry = RetryConfig {
            max_retries: state.config.archive.upload_max_retries,
            ..RetryConfig::for_upload()
        };
        Self { state, upload_retry }
    }

    /// Create an engine with a custom upload retry policy (used by tests to
    /// avoid real backoff delays).
    pub fn with_upload_retry(state: Arc<AppState>, upload_retry: RetryConfig) -> Self {
        Self { state, upload_retry }
    }

    /// Run one archival pass over every site in the hot store.
    pub async fn run(&self) -> ArchiveReport {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let retention_ms = self.state.config.archive.retention_days as i64 * 86_400_000;
        let cutoff_ms = now_ms() - retention_ms;

        let mut report = ArchiveReport {
            run_id: run_id.clone(),
            partitions_archived: 0,
            partitions_skipped: 0,
            partitions_failed: 0,
            rows_archived: 0,
            rows_deleted: 0,
            bytes_uploaded: 0,
            errors: Vec::new(),
            duration_secs: 0.0,
        };

        let partitions = {
            let store = self.state.store.lock().await;
            let mut all = Vec::new();
            match store.list_sites() {
                Ok(sites) => {
                    for site in sites {
                        match store.list_aged_partitions(&site, cutoff_ms) {
                            Ok(mut keys) => all.append(&mut keys),
                            Err(e) => report
                                .errors
                                .push(format!("partition listing failed for {site}: {e}")),
                        }
                    }
                }
                Err(e) => report.errors.push(format!("site listing failed: {e}")),
            }
            all
        };

        info!(
            "archival run {}: {} aged partition(s) before cutoff",
            run_id,
            partitions.len()
        );

        for key in &partitions {
            match self.archive_partition(key).await {
                Ok(PartitionOutcome::Archived { rows, bytes, deleted }) => {
                    report.partitions_archived += 1;
                    report.rows_archived += rows;
                    report.rows_deleted += deleted;
                    report.bytes_uploaded += bytes;
                }
                Ok(PartitionOutcome::AlreadyArchived { deleted }) => {
                    report.partitions_skipped += 1;
                    report.rows_deleted += deleted;
                }
                Err(e) => {
                    report.partitions_failed += 1;
                    report
                        .errors
                        .push(format!("{}: {}", key.object_path(), e));
                }
            }
        }

        report.duration_secs = started.elapsed().as_secs_f64();

        // Run metrics are durable for observability; losing them must not
        // fail an otherwise successful run.
        match serde_json::to_string(&report) {
            Ok(blob) => {
                let store = self.state.store.lock().await;
                if let Err(e) = store.put_raw(&keys::archive_metrics(&run_id), &blob) {
                    warn!("failed to persist archive metrics: {}", e);
                }
            }
            Err(e) => warn!("failed to encode archive metrics: {}", e),
        }

        info!(
            "archival run {} complete: archived={} skipped={} failed={} rows={} duration={:.2}s",
            run_id,
            report.partitions_archived,
            report.partitions_skipped,
            report.partitions_failed,
            report.rows_archived,
            report.duration_secs,
        );
        report
    }

    async fn archive_partition(&self, key: &PartitionKey) -> Result<PartitionOutcome, ArchiveError> {
        let path = key.object_path();

        // A verified object from an earlier run means the upload is done;
        // only the hot-row deletion still needs to converge.
        if let Some(meta) = self.state.cold.head(&path).await? {
            if meta.size > 0 {
                debug!("{} already in cold storage ({} bytes)", path, meta.size);
                let deleted = self.delete_verified(key).await?;
                return Ok(PartitionOutcome::AlreadyArchived { deleted });
            }
        }

        let rows = self.drain_rows(key).await?;
        if rows.is_empty() {
            return Ok(PartitionOutcome::AlreadyArchived { deleted: 0 });
        }
        let source_rows = rows.len() as u64;

        let data = encode_partition(&rows)?;
        let bytes = data.len() as u64;

        let mut attempt = 0;
        loop {
            match self.state.cold.put(&path, data.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    let retryable = matches!(e, vitals_cold::Error::Io(_));
                    if !retryable || attempt >= self.upload_retry.max_retries {
                        return Err(e.into());
                    }
                    let delay = self.upload_retry.delay_for_attempt(attempt);
                    warn!(
                        "upload of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        path,
                        attempt + 1,
                        self.upload_retry.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }

        // Mandatory verification: the object must exist with a non-zero
        // size before any hot row may go away.
        let verified = self
            .state
            .cold
            .head(&path)
            .await?
            .is_some_and(|meta| meta.size > 0);
        if !verified {
            return Err(ArchiveError::VerifyFailed { path });
        }

        let deleted = self.delete_verified(key).await?;
        if deleted != source_rows {
            warn!(
                "deleted {} hot rows for {} but archived {}",
                deleted, path, source_rows
            );
        }

        Ok(PartitionOutcome::Archived {
            rows: source_rows,
            bytes,
            deleted,
        })
    }

    /// Page every row of a partition out of the hot store.
    async fn drain_rows(&self, key: &PartitionKey) -> Result<Vec<Sample>, ArchiveError> {
        let batch = self.state.config.archive.fetch_batch_size;
        let mut rows = Vec::new();
        loop {
            let page = {
                let store = self.state.store.lock().await;
                store.fetch_partition_page(key, batch, rows.len())?
            };
            let done = page.len() < batch;
            rows.extend(page);
            if done {
                return Ok(rows);
            }
        }
    }

    async fn delete_verified(&self, key: &PartitionKey) -> Result<u64, ArchiveError> {
        let store = self.state.store.lock().await;
        Ok(store.delete_partition(key)? as u64)
    }
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::ScriptedApi;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use time::macros::date;
    use vitals_cold::{MemoryStore, ObjectMeta, ObjectStore, decode_partition};
    use vitals_store::Store;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.archive.retention_days = 30;
        config.archive.fetch_batch_size = 3;
        config
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    fn build_state(cold: Arc<dyn ObjectStore>, config: Config) -> Arc<AppState> {
        AppState::new(
            Store::open_in_memory().unwrap(),
            cold,
            Arc::new(ScriptedApi::new(vec![])),
            config,
        )
    }

    /// ms timestamp at noon UTC on the given date.
    fn noon(date: time::Date) -> i64 {
        date.midnight().assume_utc().unix_timestamp() * 1000 + 12 * 3600 * 1000
    }

    async fn seed_aged_rows(state: &AppState) -> PartitionKey {
        let day = date!(2024 - 01 - 05);
        let store = state.store.lock().await;
        let rows: Vec<Sample> = (0..7)
            .map(|i| Sample::new("hq", "ahu1_temp", noon(day) + i * 60_000, i as f64))
            .collect();
        store.upsert_samples(&rows, 250).unwrap();
        PartitionKey::new("hq", "ahu1_temp", day)
    }

    /// Cold store whose first `failures` puts fail with an I/O error.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
        puts: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(failures),
                puts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(&self, path: &str, data: Bytes) -> vitals_cold::Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
                .is_ok()
            {
                return Err(vitals_cold::Error::Io(std::io::Error::other("HTTP 500")));
            }
            self.inner.put(path, data).await
        }

        async fn get(&self, path: &str) -> vitals_cold::Result<Bytes> {
            self.inner.get(path).await
        }

        async fn head(&self, path: &str) -> vitals_cold::Result<Option<ObjectMeta>> {
            self.inner.head(path).await
        }
    }

    /// Cold store that accepts uploads but never admits to having them.
    struct BlackholeStore;

    #[async_trait]
    impl ObjectStore for BlackholeStore {
        async fn put(&self, _path: &str, _data: Bytes) -> vitals_cold::Result<()> {
            Ok(())
        }

        async fn get(&self, path: &str) -> vitals_cold::Result<Bytes> {
            Err(vitals_cold::Error::NotFound(path.to_string()))
        }

        async fn head(&self, _path: &str) -> vitals_cold::Result<Option<ObjectMeta>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_aged_partition_is_archived_then_deleted() {
        let cold = Arc::new(MemoryStore::new());
        let state = build_state(cold.clone(), test_config());
        let key = seed_aged_rows(&state).await;

        // A fresh row that must survive the run.
        {
            let store = state.store.lock().await;
            store
                .upsert_samples(&[Sample::new("hq", "ahu1_temp", now_ms(), 1.0)], 250)
                .unwrap();
        }

        let report = ArchivalEngine::new(Arc::clone(&state)).run().await;

        assert_eq!(report.partitions_archived, 1);
        assert_eq!(report.partitions_failed, 0);
        assert_eq!(report.rows_archived, 7);
        assert_eq!(report.rows_deleted, 7);
        assert!(report.bytes_uploaded > 0);
        assert!(report.errors.is_empty());

        // The cold object decodes back to the archived rows.
        let data = cold.get(&key.object_path()).await.unwrap();
        let decoded = decode_partition("hq", data).unwrap();
        assert_eq!(decoded.len(), 7);

        // Aged rows are gone; the fresh row survives.
        let store = state.store.lock().await;
        assert_eq!(store.count_partition(&key).unwrap(), 0);
        assert_eq!(store.count_samples(Some("hq")).unwrap(), 1);

        // Run metrics were persisted under the run id.
        let metrics = store
            .get_raw(&keys::archive_metrics(&report.run_id))
            .unwrap();
        assert!(metrics.unwrap().contains("\"partitions_archived\":1"));
    }

    #[tokio::test]
    async fn test_upload_failure_deletes_nothing() {
        // Uploads never succeed: the partition must fail without touching
        // a single hot row.
        let cold = Arc::new(FlakyStore::new(usize::MAX));
        let state = build_state(cold.clone(), test_config());
        let key = seed_aged_rows(&state).await;

        let engine = ArchivalEngine::with_upload_retry(Arc::clone(&state), fast_retry(2));
        let report = engine.run().await;

        assert_eq!(report.partitions_archived, 0);
        assert_eq!(report.partitions_failed, 1);
        assert_eq!(report.rows_deleted, 0);
        assert_eq!(report.errors.len(), 1);

        let store = state.store.lock().await;
        assert_eq!(store.count_partition(&key).unwrap(), 7);
        assert!(cold.inner.is_empty());
    }

    #[tokio::test]
    async fn test_upload_retries_through_transient_failures() {
        // Three 500s then success: archived and deleted exactly once.
        let cold = Arc::new(FlakyStore::new(3));
        let state = build_state(cold.clone(), test_config());
        let key = seed_aged_rows(&state).await;

        let engine = ArchivalEngine::with_upload_retry(Arc::clone(&state), fast_retry(4));
        let report = engine.run().await;

        assert_eq!(report.partitions_archived, 1);
        assert_eq!(report.partitions_failed, 0);
        assert_eq!(report.rows_deleted, 7);
        assert_eq!(cold.puts.load(Ordering::SeqCst), 4);

        let store = state.store.lock().await;
        assert_eq!(store.count_partition(&key).unwrap(), 0);

        // A second run finds nothing aged left to do.
        drop(store);
        let again = ArchivalEngine::with_upload_retry(state, fast_retry(4)).run().await;
        assert_eq!(again.partitions_archived, 0);
        assert_eq!(again.partitions_skipped, 0);
    }

    #[tokio::test]
    async fn test_unverified_upload_blocks_deletion() {
        let state = build_state(Arc::new(BlackholeStore), test_config());
        let key = seed_aged_rows(&state).await;

        let engine = ArchivalEngine::with_upload_retry(Arc::clone(&state), fast_retry(1));
        let report = engine.run().await;

        assert_eq!(report.partitions_archived, 0);
        assert_eq!(report.partitions_failed, 1);
        assert!(report.errors[0].contains("verification failed"));

        let store = state.store.lock().await;
        assert_eq!(store.count_partition(&key).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_existing_object_skips_upload_but_reaps_rows() {
        let cold = Arc::new(FlakyStore::new(0));
        let state = build_state(cold.clone(), test_config());
        let key = seed_aged_rows(&state).await;

        // A previous run already uploaded and verified this partition but
        // died before deleting the hot rows.
        cold.inner
            .put(&key.object_path(), Bytes::from_static(b"parquet"))
            .await
            .unwrap();

        let report = ArchivalEngine::new(Arc::clone(&state)).run().await;

        assert_eq!(report.partitions_archived, 0);
        assert_eq!(report.partitions_skipped, 1);
        assert_eq!(report.rows_deleted, 7);
        // No duplicate upload work.
        assert_eq!(cold.puts.load(Ordering::SeqCst), 0);

        let store = state.store.lock().await;
        assert_eq!(store.count_partition(&key).unwrap(), 0);
    }
}
