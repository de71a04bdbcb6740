//! Core types for sensor time-series data.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Date, OffsetDateTime};

use crate::error::{StateError, StateResult};

/// A single normalized sensor sample.
///
/// Samples are immutable once written and uniquely identified by
/// `(site, point_name, ts)`. Timestamps are milliseconds since the Unix
/// epoch, UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Site the sample belongs to.
    pub site: String,
    /// Raw point name as reported by the remote API.
    pub point_name: String,
    /// Capture time in milliseconds since the Unix epoch.
    pub ts: i64,
    /// Measured value. Always finite; non-finite values are dropped upstream.
    pub value: f64,
}

impl Sample {
    /// Create a new sample.
    pub fn new(
        site: impl Into<String>,
        point_name: impl Into<String>,
        ts: i64,
        value: f64,
    ) -> Self {
        Self {
            site: site.into(),
            point_name: point_name.into(),
            ts,
            value,
        }
    }

    /// The capture time as an [`OffsetDateTime`], if representable.
    pub fn datetime(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.ts) * 1_000_000).ok()
    }

    /// The UTC calendar day this sample falls on, if representable.
    pub fn date(&self) -> Option<Date> {
        self.datetime().map(|dt| dt.date())
    }
}

/// Per-site incremental sync cursor.
///
/// `last_sync_ts` is the maximum sample timestamp actually written by the
/// last successful sync cycle, never wall-clock time. It is non-decreasing
/// except on explicit reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Site this cursor belongs to.
    pub site: String,
    /// Maximum written sample timestamp, milliseconds since the Unix epoch.
    pub last_sync_ts: i64,
    /// When the cursor was last advanced.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SyncState {
    /// Create a cursor positioned at `last_sync_ts`.
    pub fn new(site: impl Into<String>, last_sync_ts: i64) -> Self {
        Self {
            site: site.into(),
            last_sync_ts,
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Freshness classification for a site's hot data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Lag is at or below the target; a sync cycle is a no-op.
    Fresh,
    /// Lag exceeds the target; catch-up cycles are warranted.
    Lagging,
    /// Lag exceeds the urgent threshold, or the site has no data at all.
    Urgent,
}

impl Freshness {
    /// Classify a data age in seconds against the configured thresholds.
    pub fn classify(age_secs: i64, target_secs: i64, urgent_secs: i64) -> Self {
        if age_secs <= target_secs {
            Freshness::Fresh
        } else if age_secs <= urgent_secs {
            Freshness::Lagging
        } else {
            Freshness::Urgent
        }
    }
}

/// Format a millisecond epoch timestamp as an RFC 3339 UTC string.
pub fn ms_to_rfc3339(ms: i64) -> StateResult<String> {
    let dt = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .map_err(|e| StateError::InvalidTimestamp(e.to_string()))?;
    dt.format(&Rfc3339)
        .map_err(|e| StateError::InvalidTimestamp(e.to_string()))
}

/// Parse an RFC 3339 timestamp into milliseconds since the Unix epoch.
pub fn rfc3339_to_ms(s: &str) -> StateResult<i64> {
    let dt = OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| StateError::InvalidTimestamp(format!("{s}: {e}")))?;
    Ok((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}
