//! Historical backfill engine.
//!
//! A backfill is triggered with a date range and then re-triggered until it
//! reports `complete`. Each trigger processes a bounded number of pages and
//! persists the continuation state after every one, so invocations can die
//! at any point without losing or re-fetching more than a single page.

use std::sync::Arc;

use serde::Serialize;
use time::Date;
use tracing::{info, warn};

use vitals_store::StateStore;
use vitals_types::{BackfillState, BackfillStatus, ms_to_rfc3339};

use crate::state::AppState;

/// Result of one backfill trigger.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    /// Continuation state after this invocation.
    pub state: BackfillState,
    /// Pages processed by this invocation.
    pub pages_processed: u32,
    /// The fetch error that stopped this invocation early, if any. The
    /// failed page's position is preserved and retried next trigger.
    pub error: Option<String>,
}

impl TriggerOutcome {
    /// Whether the caller should trigger again to make further progress.
    pub fn continuation(&self) -> bool {
        self.state.continuation()
    }
}

/// Errors surfaced by a backfill trigger.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// A new backfill was requested without a date range.
    #[error("missing required parameters: start_date and end_date")]
    MissingRange,

    /// The requested range is not usable.
    #[error("invalid date range: {0}")]
    InvalidRange(String),

    /// Durable state could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] vitals_store::Error),

    /// An illegal state transition.
    #[error("state error: {0}")]
    State(#[from] vitals_types::StateError),
}

/// Continuation-based historical backfill worker.
pub struct BackfillEngine {
    state: Arc<AppState>,
}

impl BackfillEngine {
    /// Create a new engine.
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Current continuation state for a site, if a backfill exists.
    pub async fn status(&self, site: &str) -> Result<Option<BackfillState>, BackfillError> {
        let store = self.state.store.lock().await;
        Ok(store.backfill_state(site)?)
    }

    /// Start, continue, or reset a backfill for `site`.
    ///
    /// `range` is required when no backfill exists or when `reset` is set;
    /// an existing backfill is otherwise continued from its persisted
    /// position and the provided range is ignored.
    pub async fn trigger(
        &self,
        site: &str,
        range: Option<(Date, Date)>,
        reset: bool,
    ) -> Result<TriggerOutcome, BackfillError> {
        let existing = {
            let store = self.state.store.lock().await;
            store.backfill_state(site)?
        };

        let mut backfill = match (existing, reset) {
            (Some(state), false) => state,
            (_, true) | (None, false) => {
                let (start, end) = range.ok_or(BackfillError::MissingRange)?;
                let fresh = BackfillState::new(site, start, end)
                    .map_err(|e| BackfillError::InvalidRange(e.to_string()))?;
                let store = self.state.store.lock().await;
                store.put_backfill_state(&fresh)?;
                info!("backfill for {} reset to {}..{}", site, start, end);
                fresh
            }
        };

        if backfill.status == BackfillStatus::Complete {
            return Ok(TriggerOutcome {
                state: backfill,
                pages_processed: 0,
                error: None,
            });
        }

        backfill.begin()?;

        let pages_per_run = self.state.config.backfill.pages_per_run;
        let batch_size = self.state.config.sync.upsert_batch_size;
        let mut pages_processed = 0;
        let mut error = None;

        while pages_processed < pages_per_run && backfill.status == BackfillStatus::InProgress {
            let (day_start, day_end) = day_window(backfill.current_date)?;

            match self
                .state
                .api
                .fetch_page(site, &day_start, &day_end, backfill.current_cursor.as_deref(), &[])
                .await
            {
                Ok(page) => {
                    if !page.samples.is_empty() {
                        let store = self.state.store.lock().await;
                        store.upsert_samples(&page.samples, batch_size)?;
                    }
                    backfill.record_page(page.samples.len() as u64, page.next_cursor)?;
                    pages_processed += 1;
                }
                Err(e) => {
                    warn!(
                        "backfill page failed for {} at {} (cursor {:?}): {}",
                        site, backfill.current_date, backfill.current_cursor, e
                    );
                    backfill.record_error(e.to_string());
                    error = Some(e.to_string());
                }
            }

            // Persisted after every page (and every failure), never just at
            // day boundaries: a crash resumes at the exact cursor.
            {
                let store = self.state.store.lock().await;
                store.put_backfill_state(&backfill)?;
            }

            if error.is_some() {
                break;
            }
        }

        info!(
            "backfill for {}: {} page(s), status {}, {}/{} days",
            site,
            pages_processed,
            backfill.status.as_str(),
            backfill.completed_dates.len(),
            backfill.total_days(),
        );

        Ok(TriggerOutcome {
            state: backfill,
            pages_processed,
            error,
        })
    }
}

/// RFC 3339 bounds `[midnight, next midnight)` of a backfill day.
fn day_window(date: Date) -> Result<(String, String), BackfillError> {
    let start_ms = date.midnight().assume_utc().unix_timestamp() * 1000;
    let end_ms = match date.next_day() {
        Some(next) => next.midnight().assume_utc().unix_timestamp() * 1000,
        None => start_ms,
    };
    Ok((ms_to_rfc3339(start_ms)?, ms_to_rfc3339(end_ms)?))
}
