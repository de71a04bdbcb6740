//! Freshness measurement.
//!
//! "Data age" is the distance between now and the newest hot-store sample
//! for a site. It decides whether a sync cycle is a no-op, warrants
//! catch-up cycles, or should jump the site-selection queue.

use time::OffsetDateTime;

use vitals_store::Store;
use vitals_types::Freshness;

use crate::config::SyncConfig;

/// Computes and classifies per-site data age.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessMonitor {
    target_lag_secs: i64,
    urgent_lag_secs: i64,
}

impl FreshnessMonitor {
    /// Build a monitor from the sync configuration's thresholds.
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            target_lag_secs: config.target_lag_secs,
            urgent_lag_secs: config.urgent_lag_secs,
        }
    }

    /// Data age for a site in seconds, or `None` when the site has no
    /// hot data at all.
    pub fn age_secs(&self, store: &Store, site: &str) -> vitals_store::Result<Option<i64>> {
        let newest = store.newest_timestamp(site)?;
        Ok(newest.map(|ts| {
            let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
            (now_ms - ts) / 1000
        }))
    }

    /// Classify a site. A site with no data is always [`Freshness::Urgent`].
    pub fn classify(&self, store: &Store, site: &str) -> vitals_store::Result<Freshness> {
        Ok(match self.age_secs(store, site)? {
            Some(age) => Freshness::classify(age, self.target_lag_secs, self.urgent_lag_secs),
            None => Freshness::Urgent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_types::Sample;

    fn monitor() -> FreshnessMonitor {
        FreshnessMonitor::new(&SyncConfig::default())
    }

    fn now_ms() -> i64 {
        (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }

    #[test]
    fn test_no_data_is_urgent() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(monitor().age_secs(&store, "hq").unwrap(), None);
        assert_eq!(monitor().classify(&store, "hq").unwrap(), Freshness::Urgent);
    }

    #[test]
    fn test_recent_data_is_fresh() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_samples(&[Sample::new("hq", "p", now_ms() - 10_000, 1.0)], 250)
            .unwrap();

        let age = monitor().age_secs(&store, "hq").unwrap().unwrap();
        assert!((9..=60).contains(&age), "age was {age}");
        assert_eq!(monitor().classify(&store, "hq").unwrap(), Freshness::Fresh);
    }

    #[test]
    fn test_stale_data_classification() {
        let store = Store::open_in_memory().unwrap();
        // Five minutes old: past the 90s target, below the 600s urgent bar.
        store
            .upsert_samples(&[Sample::new("hq", "p", now_ms() - 300_000, 1.0)], 250)
            .unwrap();
        assert_eq!(monitor().classify(&store, "hq").unwrap(), Freshness::Lagging);

        // An hour old on another site: urgent.
        store
            .upsert_samples(&[Sample::new("annex", "p", now_ms() - 3_600_000, 1.0)], 250)
            .unwrap();
        assert_eq!(
            monitor().classify(&store, "annex").unwrap(),
            Freshness::Urgent
        );
    }
}
