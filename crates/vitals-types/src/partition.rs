//! Archival partition keys and cold-storage layout.

use serde::{Deserialize, Serialize};
use time::Date;

/// Identity of one archival unit: all samples for a point on a calendar day.
///
/// The key maps to exactly one immutable object in cold storage, so the
/// object path doubles as the partition's content address for existence
/// checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Site the partition belongs to.
    pub site: String,
    /// Point name, as stored in the hot store.
    pub point_name: String,
    /// Calendar day, UTC.
    pub date: Date,
}

impl PartitionKey {
    /// Create a partition key.
    pub fn new(site: impl Into<String>, point_name: impl Into<String>, date: Date) -> Self {
        Self {
            site: site.into(),
            point_name: point_name.into(),
            date,
        }
    }

    /// Deterministic cold-storage path:
    /// `timeseries/{site}/{YYYY}/{MM}/{DD}/{point}.parquet`.
    pub fn object_path(&self) -> String {
        format!(
            "timeseries/{}/{:04}/{:02}/{:02}/{}.parquet",
            self.site,
            self.date.year(),
            u8::from(self.date.month()),
            self.date.day(),
            sanitize_component(&self.point_name),
        )
    }
}

/// Replace path-hostile characters in a point name.
///
/// Point names routinely contain slashes and spaces
/// (`ahu1/supply temp`); the object path must stay a flat file name per
/// partition directory.
fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
