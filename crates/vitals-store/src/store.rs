//! Hot store implementation.

use std::path::Path;

use rusqlite::Connection;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, info};

use vitals_types::{PartitionKey, Sample};

use crate::error::{Error, Result};
use crate::schema;

/// Result of an upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows written (inserted or overwritten).
    pub written: usize,
    /// Maximum timestamp among the written rows, ms since the epoch.
    /// `None` when nothing was written.
    pub max_ts: Option<i64>,
}

/// SQLite-backed store for the vitals pipeline.
///
/// Holds the hot sample rows plus the kv and lock tables the [`crate::state`]
/// and [`crate::lock`] modules operate on.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// Sample operations
impl Store {
    /// Idempotently upsert samples in bounded batches.
    ///
    /// Identity is `(site, point_name, ts)`; a repeated sample overwrites
    /// the value instead of creating a duplicate row, so re-fetching an
    /// overlapping window is harmless.
    pub fn upsert_samples(&self, samples: &[Sample], batch_size: usize) -> Result<UpsertOutcome> {
        if samples.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let mut outcome = UpsertOutcome::default();
        let batch_size = batch_size.max(1);

        for batch in samples.chunks(batch_size) {
            let tx = self.conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO samples (site, point_name, ts, value)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(site, point_name, ts) DO UPDATE SET value = excluded.value",
                )?;
                for sample in batch {
                    stmt.execute(rusqlite::params![
                        sample.site,
                        sample.point_name,
                        sample.ts,
                        sample.value,
                    ])?;
                    outcome.written += 1;
                    outcome.max_ts = Some(outcome.max_ts.map_or(sample.ts, |m: i64| m.max(sample.ts)));
                }
            }
            tx.commit()?;
        }

        debug!("Upserted {} samples", outcome.written);
        Ok(outcome)
    }

    /// Newest sample timestamp for a site, ms since the epoch.
    pub fn newest_timestamp(&self, site: &str) -> Result<Option<i64>> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(ts) FROM samples WHERE site = ?",
            [site],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Distinct sites present in the hot store.
    pub fn list_sites(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT site FROM samples ORDER BY site")?;
        let sites = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    /// Count samples, optionally for one site.
    pub fn count_samples(&self, site: Option<&str>) -> Result<u64> {
        let count: i64 = match site {
            Some(site) => self.conn.query_row(
                "SELECT COUNT(*) FROM samples WHERE site = ?",
                [site],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM samples", [], |row| row.get(0))?,
        };

        Ok(count as u64)
    }
}

// Partition operations (archival)
impl Store {
    /// Enumerate `(point, day)` partitions for a site entirely older than
    /// `cutoff_ms`, oldest day first.
    pub fn list_aged_partitions(&self, site: &str, cutoff_ms: i64) -> Result<Vec<PartitionKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT point_name, date(ts / 1000, 'unixepoch') AS day
             FROM samples
             WHERE site = ?1 AND ts < ?2
             ORDER BY day ASC, point_name ASC",
        )?;

        let rows = stmt
            .query_map(rusqlite::params![site, cutoff_ms], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let format = format_description!("[year]-[month]-[day]");
        let mut partitions = Vec::with_capacity(rows.len());
        for (point_name, day) in rows {
            let date =
                Date::parse(&day, &format).map_err(|e| Error::InvalidDate(format!("{day}: {e}")))?;
            partitions.push(PartitionKey::new(site, point_name, date));
        }

        Ok(partitions)
    }

    /// Count rows in a partition.
    pub fn count_partition(&self, key: &PartitionKey) -> Result<u64> {
        let (start_ms, end_ms) = day_bounds_ms(key.date);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM samples
             WHERE site = ?1 AND point_name = ?2 AND ts >= ?3 AND ts < ?4",
            rusqlite::params![key.site, key.point_name, start_ms, end_ms],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Page rows out of a partition in timestamp order.
    pub fn fetch_partition_page(
        &self,
        key: &PartitionKey,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Sample>> {
        let (start_ms, end_ms) = day_bounds_ms(key.date);
        let mut stmt = self.conn.prepare_cached(
            "SELECT site, point_name, ts, value FROM samples
             WHERE site = ?1 AND point_name = ?2 AND ts >= ?3 AND ts < ?4
             ORDER BY ts ASC LIMIT ?5 OFFSET ?6",
        )?;

        let samples = stmt
            .query_map(
                rusqlite::params![
                    key.site,
                    key.point_name,
                    start_ms,
                    end_ms,
                    limit as i64,
                    offset as i64
                ],
                |row| {
                    Ok(Sample {
                        site: row.get(0)?,
                        point_name: row.get(1)?,
                        ts: row.get(2)?,
                        value: row.get(3)?,
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(samples)
    }

    /// Delete all rows in a partition, returning the number deleted.
    ///
    /// Callers must only invoke this after the partition's cold-storage
    /// object has been verified.
    pub fn delete_partition(&self, key: &PartitionKey) -> Result<usize> {
        let (start_ms, end_ms) = day_bounds_ms(key.date);
        let deleted = self.conn.execute(
            "DELETE FROM samples
             WHERE site = ?1 AND point_name = ?2 AND ts >= ?3 AND ts < ?4",
            rusqlite::params![key.site, key.point_name, start_ms, end_ms],
        )?;
        info!(
            "Deleted {} hot rows for {}/{}/{}",
            deleted, key.site, key.point_name, key.date
        );
        Ok(deleted)
    }
}

/// Millisecond bounds `[start, end)` of a UTC calendar day.
fn day_bounds_ms(date: Date) -> (i64, i64) {
    let start = date.midnight().assume_utc().unix_timestamp() * 1000;
    let end = match date.next_day() {
        Some(next) => next.midnight().assume_utc().unix_timestamp() * 1000,
        None => i64::MAX,
    };
    (start, end)
}

/// Millisecond timestamp for "now".
pub(crate) fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn sample(point: &str, ts: i64, value: f64) -> Sample {
        Sample::new("hq", point, ts, value)
    }

    /// ms timestamp at noon UTC on the given date.
    fn noon(date: Date) -> i64 {
        date.midnight().assume_utc().unix_timestamp() * 1000 + 12 * 3600 * 1000
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();

        let samples = vec![sample("p1", 1000, 1.0), sample("p2", 2000, 2.0)];
        let first = store.upsert_samples(&samples, 250).unwrap();
        assert_eq!(first.written, 2);
        assert_eq!(first.max_ts, Some(2000));

        // Same rows again, one with a new value: still two rows total.
        let again = vec![sample("p1", 1000, 9.0), sample("p2", 2000, 2.0)];
        store.upsert_samples(&again, 250).unwrap();

        assert_eq!(store.count_samples(Some("hq")).unwrap(), 2);
        let rows = store
            .fetch_partition_page(
                &PartitionKey::new("hq", "p1", date!(1970 - 01 - 01)),
                10,
                0,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].value - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_upsert_empty_is_noop() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store.upsert_samples(&[], 250).unwrap();
        assert_eq!(outcome, UpsertOutcome::default());
    }

    #[test]
    fn test_upsert_batches_cover_all_rows() {
        let store = Store::open_in_memory().unwrap();
        let samples: Vec<Sample> = (0..10).map(|i| sample("p", i * 1000, i as f64)).collect();

        let outcome = store.upsert_samples(&samples, 3).unwrap();
        assert_eq!(outcome.written, 10);
        assert_eq!(outcome.max_ts, Some(9000));
        assert_eq!(store.count_samples(None).unwrap(), 10);
    }

    #[test]
    fn test_newest_timestamp() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.newest_timestamp("hq").unwrap(), None);

        store
            .upsert_samples(&[sample("p", 5000, 1.0), sample("p", 3000, 2.0)], 250)
            .unwrap();
        assert_eq!(store.newest_timestamp("hq").unwrap(), Some(5000));
        assert_eq!(store.newest_timestamp("other").unwrap(), None);
    }

    #[test]
    fn test_list_aged_partitions_honors_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let old_day = date!(2024 - 01 - 05);
        let new_day = date!(2024 - 06 - 01);

        store
            .upsert_samples(
                &[
                    sample("a", noon(old_day), 1.0),
                    sample("b", noon(old_day), 2.0),
                    sample("a", noon(new_day), 3.0),
                ],
                250,
            )
            .unwrap();

        let cutoff = noon(date!(2024 - 03 - 01));
        let partitions = store.list_aged_partitions("hq", cutoff).unwrap();

        assert_eq!(
            partitions,
            vec![
                PartitionKey::new("hq", "a", old_day),
                PartitionKey::new("hq", "b", old_day),
            ]
        );
    }

    #[test]
    fn test_partition_fetch_and_delete() {
        let store = Store::open_in_memory().unwrap();
        let day = date!(2024 - 01 - 05);
        let other_day = date!(2024 - 01 - 06);

        let mut rows = Vec::new();
        for i in 0..5 {
            rows.push(sample("p", noon(day) + i * 60_000, i as f64));
        }
        rows.push(sample("p", noon(other_day), 99.0));
        store.upsert_samples(&rows, 250).unwrap();

        let key = PartitionKey::new("hq", "p", day);
        assert_eq!(store.count_partition(&key).unwrap(), 5);

        // Page through in twos, ordered by timestamp.
        let page1 = store.fetch_partition_page(&key, 2, 0).unwrap();
        let page2 = store.fetch_partition_page(&key, 2, 2).unwrap();
        let page3 = store.fetch_partition_page(&key, 2, 4).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert_eq!(page3.len(), 1);
        assert!(page1[0].ts < page1[1].ts);

        let deleted = store.delete_partition(&key).unwrap();
        assert_eq!(deleted, 5);
        assert_eq!(store.count_partition(&key).unwrap(), 0);

        // The neighboring day is untouched.
        let other = PartitionKey::new("hq", "p", other_day);
        assert_eq!(store.count_partition(&other).unwrap(), 1);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let store = Store::open(&path).unwrap();
        assert_eq!(store.count_samples(None).unwrap(), 0);
        assert!(path.exists());
    }
}
