//! Incremental sync orchestrator and catch-up loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use vitals_store::{LockStore, StateStore, fail_open_acquire, keys};
use vitals_types::{Freshness, Sample, SyncState, ms_to_rfc3339};

use crate::freshness::FreshnessMonitor;
use crate::state::AppState;

/// Outcome of one sync invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Whether the run lock was obtained. When false nothing was processed.
    pub lock_acquired: bool,
    /// Per-site results, in processing order; catch-up cycles append.
    pub sites: Vec<SiteSyncResult>,
    /// Extra catch-up cycles run after the first pass.
    pub catchup_cycles: u32,
    /// Wall-clock duration of the invocation.
    pub duration_secs: f64,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            lock_acquired: false,
            sites: Vec::new(),
            catchup_cycles: 0,
            duration_secs: 0.0,
        }
    }

    /// Total rows written across all cycles.
    pub fn total_written(&self) -> usize {
        self.sites.iter().map(|s| s.written).sum()
    }

    /// Sites whose last cycle in this invocation failed.
    pub fn failed_sites(&self) -> usize {
        self.sites.iter().filter(|s| s.error.is_some()).count()
    }
}

/// Result of one sync cycle for one site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteSyncResult {
    /// Site processed.
    pub site: String,
    /// Pages fetched.
    pub pages: usize,
    /// Raw samples returned by the API.
    pub samples: usize,
    /// Rows upserted into the hot store.
    pub written: usize,
    /// Samples dropped for data quality.
    pub skipped: usize,
    /// The sync cursor after this cycle, ms since the epoch.
    pub last_sync_ts: Option<i64>,
    /// Failure, if the cycle aborted. Earlier pages of the window may still
    /// have been written; the cursor is only advanced on full success.
    pub error: Option<String>,
}

/// Errors inside one site's sync cycle.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("API error: {0}")]
    Api(#[from] vitals_client::Error),
    #[error("store error: {0}")]
    Store(#[from] vitals_store::Error),
    #[error("state error: {0}")]
    State(#[from] vitals_types::StateError),
}

/// The periodic sync entry point.
pub struct SyncOrchestrator {
    state: Arc<AppState>,
}

impl SyncOrchestrator {
    /// Create a new orchestrator.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run one sync invocation: lock, select sites, sync each, then run
    /// bounded catch-up cycles while any selected site stays behind target.
    pub async fn run(&self) -> SyncReport {
        let cfg = &self.state.config.sync;
        let started = Instant::now();
        let lock_key = keys::lock(&lock_scope(now_ms()));
        let ttl = Duration::from_secs(cfg.lock_ttl_secs);

        let acquired = {
            let store = self.state.store.lock().await;
            fail_open_acquire(&*store, &lock_key, ttl)
        };
        if !acquired {
            info!("sync run lock {} held elsewhere, skipping", lock_key);
            return SyncReport::skipped();
        }

        let report = self.run_locked(started).await;

        {
            let store = self.state.store.lock().await;
            if let Err(e) = store.release(&lock_key) {
                warn!("failed to release {}: {}", lock_key, e);
            }
        }

        info!(
            "sync complete: sites={} written={} failed={} catchup_cycles={} duration={:.2}s",
            report.sites.len(),
            report.total_written(),
            report.failed_sites(),
            report.catchup_cycles,
            report.duration_secs,
        );
        report
    }

    async fn run_locked(&self, started: Instant) -> SyncReport {
        let cfg = &self.state.config.sync;
        let monitor = FreshnessMonitor::new(cfg);

        let candidates = self.candidate_sites().await;
        if candidates.is_empty() {
            warn!("no sites to sync");
            return SyncReport {
                lock_acquired: true,
                sites: Vec::new(),
                catchup_cycles: 0,
                duration_secs: started.elapsed().as_secs_f64(),
            };
        }

        let selected = {
            let store = self.state.store.lock().await;

            let mut urgent = HashSet::new();
            for site in &candidates {
                // An unreadable freshness means the site needs attention.
                match monitor.classify(&store, site) {
                    Ok(Freshness::Urgent) | Err(_) => {
                        urgent.insert(site.clone());
                    }
                    Ok(_) => {}
                }
            }

            let rotation = store.rotation_cursor().unwrap_or(0);
            let (selected, new_rotation) =
                select_sites(&candidates, &urgent, cfg.max_sites_per_run, rotation);
            if let Err(e) = store.put_rotation_cursor(new_rotation) {
                warn!("failed to persist rotation cursor: {}", e);
            }
            selected
        };

        let mut sites = Vec::new();
        for site in &selected {
            sites.push(self.sync_site(site).await);
        }

        // Catch-up: repeat cycles for sites still behind target, bounded by
        // the cycle cap and the wall-clock budget, whichever comes first.
        let budget = Duration::from_secs(cfg.catchup_budget_secs);
        let mut catchup_cycles = 0;
        while catchup_cycles < cfg.catchup_max_cycles && started.elapsed() < budget {
            let lagging: Vec<String> = {
                let store = self.state.store.lock().await;
                selected
                    .iter()
                    .filter(|site| {
                        !matches!(monitor.classify(&store, site), Ok(Freshness::Fresh))
                    })
                    .cloned()
                    .collect()
            };
            if lagging.is_empty() {
                break;
            }

            info!("catch-up cycle {}: {} site(s) lagging", catchup_cycles + 1, lagging.len());
            for site in &lagging {
                sites.push(self.sync_site(site).await);
                if started.elapsed() >= budget {
                    break;
                }
            }
            catchup_cycles += 1;
        }

        SyncReport {
            lock_acquired: true,
            sites,
            catchup_cycles,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }

    /// Configured sites, or discovery from the remote API when none are
    /// configured.
    async fn candidate_sites(&self) -> Vec<String> {
        if !self.state.config.sites.is_empty() {
            return self.state.config.sites.clone();
        }
        match self.state.api.list_sites().await {
            Ok(sites) => sites,
            Err(e) => {
                warn!("site discovery failed: {}", e);
                Vec::new()
            }
        }
    }

    /// One sync cycle for one site. Failures are captured, not propagated,
    /// so one bad site never aborts the batch.
    async fn sync_site(&self, site: &str) -> SiteSyncResult {
        match self.sync_site_inner(site).await {
            Ok(result) => result,
            Err(e) => {
                warn!("sync failed for {}: {}", site, e);
                SiteSyncResult {
                    site: site.to_string(),
                    pages: 0,
                    samples: 0,
                    written: 0,
                    skipped: 0,
                    last_sync_ts: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn sync_site_inner(&self, site: &str) -> Result<SiteSyncResult, SyncError> {
        let cfg = &self.state.config.sync;
        let now = now_ms();

        let previous = {
            let store = self.state.store.lock().await;
            store.sync_state(site)?
        };

        let window_start = match &previous {
            Some(state) => state.last_sync_ts - (cfg.lookback_buffer_secs as i64 * 1000),
            None => now - (cfg.first_run_lookback_hours as i64 * 3_600_000),
        };
        let window_end = now.min(window_start + cfg.window_cap_minutes as i64 * 60_000);

        let mut result = SiteSyncResult {
            site: site.to_string(),
            pages: 0,
            samples: 0,
            written: 0,
            skipped: 0,
            last_sync_ts: previous.as_ref().map(|p| p.last_sync_ts),
            error: None,
        };
        if window_start >= window_end {
            return Ok(result);
        }

        let start_iso = ms_to_rfc3339(window_start)?;
        let end_iso = ms_to_rfc3339(window_end)?;

        let mut cursor: Option<String> = None;
        let mut max_written: Option<i64> = None;
        loop {
            if result.pages >= cfg.max_pages_per_window {
                break;
            }

            let page = self
                .state
                .api
                .fetch_page(site, &start_iso, &end_iso, cursor.as_deref(), &cfg.point_names)
                .await?;

            result.pages += 1;
            result.samples += page.samples.len();
            result.skipped += page.skipped;

            let deduped = dedup_samples(page.samples);
            if !deduped.is_empty() {
                let store = self.state.store.lock().await;
                let outcome = store.upsert_samples(&deduped, cfg.upsert_batch_size)?;
                result.written += outcome.written;
                max_written = match (max_written, outcome.max_ts) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        // Advance the cursor to the newest timestamp actually written, never
        // wall-clock time. A window that returned nothing leaves the cursor
        // untouched so the next window's lower bound cannot skip data.
        if let Some(max_ts) = max_written {
            let advanced = previous.map_or(max_ts, |p| p.last_sync_ts.max(max_ts));
            let store = self.state.store.lock().await;
            store.put_sync_state(&SyncState::new(site, advanced))?;
            result.last_sync_ts = Some(advanced);
        }

        Ok(result)
    }
}

/// Lock scope for one invocation: sharded per minute so a wedged run cannot
/// block the scheduler for longer than its TTL plus the minute boundary.
pub(crate) fn lock_scope(now_ms: i64) -> String {
    format!("sync:{}", now_ms / 60_000)
}

/// Pick up to `cap` sites: urgent ones first (in candidate order), the rest
/// round-robin from the persisted rotation cursor so no site starves.
fn select_sites(
    candidates: &[String],
    urgent: &HashSet<String>,
    cap: usize,
    rotation: u64,
) -> (Vec<String>, u64) {
    let mut selected: Vec<String> = candidates
        .iter()
        .filter(|site| urgent.contains(*site))
        .take(cap)
        .cloned()
        .collect();

    let mut taken_rr = 0u64;
    for i in 0..candidates.len() {
        if selected.len() >= cap {
            break;
        }
        let candidate = &candidates[(rotation as usize + i) % candidates.len()];
        if !selected.contains(candidate) {
            selected.push(candidate.clone());
            taken_rr += 1;
        }
    }

    (selected, rotation + taken_rr)
}

/// Last write wins for duplicate `(point, ts)` pairs within a fetch, so the
/// upsert never churns on pages that overlap at window edges.
fn dedup_samples(samples: Vec<Sample>) -> Vec<Sample> {
    let mut seen: HashMap<(String, i64), Sample> = HashMap::with_capacity(samples.len());
    for sample in samples {
        seen.insert((sample.point_name.clone(), sample.ts), sample);
    }
    let mut deduped: Vec<Sample> = seen.into_values().collect();
    deduped.sort_by(|a, b| (&a.point_name, a.ts).cmp(&(&b.point_name, b.ts)));
    deduped
}

fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
