//! Persistent time-series store for power readings.
//!
//! Readings are grouped into one bucket per calendar day and mirrored to a
//! compact JSON document on disk. Every write goes through a temp file,
//! `sync_all` and a rename before `record` returns, so the file is never
//! half-written. All mutating calls do file IO on the calling thread.

use crate::error::StoreError;
use chrono::{Days, Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// One timestamped power sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: NaiveDateTime,
    pub power_kw: f64,
}

impl Reading {
    pub fn new(timestamp: NaiveDateTime, power_kw: f64) -> Self {
        Self { timestamp, power_kw }
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

/// All readings recorded on one calendar date, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct DayBucket {
    pub date: NaiveDate,
    pub readings: Vec<Reading>,
}

/// How many days of history survive a maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    retention_days: u32,
}

impl RetentionPolicy {
    pub fn new(retention_days: u32) -> Result<Self, StoreError> {
        if retention_days < 1 {
            return Err(StoreError::InvalidRetention(retention_days));
        }
        Ok(Self { retention_days })
    }

    pub fn days(&self) -> u32 {
        self.retention_days
    }

    /// Oldest date that may still hold data relative to `today`.
    pub fn horizon(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.retention_days)))
            .unwrap_or(NaiveDate::MIN)
    }
}

// On-disk layout: a root list of days, each carrying its power entries.
#[derive(Debug, Default, Serialize, Deserialize)]
struct EnergyDocument {
    #[serde(default)]
    days: Vec<DayEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DayEntry {
    date: NaiveDate,
    #[serde(default)]
    power: Vec<PowerEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PowerEntry {
    time: NaiveTime,
    value: f64,
}

/// Bucket arena addressed by date key.
#[derive(Debug)]
struct StoreInner {
    buckets: Vec<DayBucket>,
    index: HashMap<NaiveDate, usize>,
    retention: RetentionPolicy,
}

impl StoreInner {
    fn new(retention: RetentionPolicy) -> Self {
        Self {
            buckets: Vec::new(),
            index: HashMap::new(),
            retention,
        }
    }

    fn from_document(document: EnergyDocument, retention: RetentionPolicy) -> Self {
        let mut inner = Self::new(retention);
        for day in document.days {
            for entry in day.power {
                if !is_valid_power(entry.value) {
                    warn!(
                        "Skipping invalid stored reading {} at {} {}",
                        entry.value, day.date, entry.time
                    );
                    continue;
                }
                inner.push(Reading::new(day.date.and_time(entry.time), entry.value));
            }
        }
        inner
    }

    fn to_document(&self) -> EnergyDocument {
        EnergyDocument {
            days: self
                .buckets
                .iter()
                .map(|bucket| DayEntry {
                    date: bucket.date,
                    power: bucket
                        .readings
                        .iter()
                        .map(|r| PowerEntry {
                            time: r.timestamp.time(),
                            value: r.power_kw,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Append a reading, creating its day bucket on first use. Returns true if a
    /// bucket was created.
    fn push(&mut self, reading: Reading) -> bool {
        let date = reading.date();
        match self.index.get(&date) {
            Some(&slot) => {
                self.buckets[slot].readings.push(reading);
                false
            }
            None => {
                self.index.insert(date, self.buckets.len());
                self.buckets.push(DayBucket {
                    date,
                    readings: vec![reading],
                });
                true
            }
        }
    }

    /// Undo the most recent `push`.
    fn pop(&mut self, date: NaiveDate, created_bucket: bool) {
        if created_bucket {
            self.index.remove(&date);
            self.buckets.pop();
        } else if let Some(&slot) = self.index.get(&date) {
            self.buckets[slot].readings.pop();
        }
    }

    fn retain_from(&mut self, horizon: NaiveDate) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|bucket| bucket.date >= horizon);
        self.index = self
            .buckets
            .iter()
            .enumerate()
            .map(|(slot, bucket)| (bucket.date, slot))
            .collect();
        before - self.buckets.len()
    }

    fn collect_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<Reading> {
        let mut readings: Vec<Reading> = self
            .buckets
            .iter()
            .filter(|bucket| bucket.date >= start && bucket.date <= end)
            .flat_map(|bucket| bucket.readings.iter().copied())
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        readings.sort_by_key(|r| r.timestamp);
        readings
    }
}

fn is_valid_power(power_kw: f64) -> bool {
    power_kw.is_finite() && power_kw >= 0.0
}

/// Current local calendar date.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Durable store of readings with a retention horizon.
///
/// Readers share the lock; `record`, `prune` and retention changes take it
/// exclusively for the whole mutate-and-flush sequence.
pub struct TimeSeriesStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
}

impl TimeSeriesStore {
    /// Open the store at `path`, creating an empty one if the file is missing and
    /// replacing it with an empty one if it cannot be parsed. Runs a pruning pass.
    pub fn open(path: &Path, retention_days: u32) -> Result<Self, StoreError> {
        Self::open_at(path, retention_days, today())
    }

    pub fn open_at(path: &Path, retention_days: u32, today: NaiveDate) -> Result<Self, StoreError> {
        let retention = RetentionPolicy::new(retention_days)?;

        // Missing or unreadable files both start empty and are rewritten at once
        let (inner, needs_write) = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| StoreError::Persistence {
                path: path.display().to_string(),
                source: e,
            })?;
            match parse_document(&contents) {
                Ok(document) => (StoreInner::from_document(document, retention), false),
                Err(e) => {
                    warn!(
                        "Energy data file {:?} is unreadable ({}), starting with an empty store; previous data is lost",
                        path, e
                    );
                    (StoreInner::new(retention), true)
                }
            }
        } else {
            info!("No energy data file at {:?}, creating an empty store", path);
            (StoreInner::new(retention), true)
        };

        let store = Self {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
        };

        if needs_write {
            let inner = store.inner.read().unwrap_or_else(PoisonError::into_inner);
            store.persist(&inner)?;
        }

        store.prune_at(retention_days, today)?;
        Ok(store)
    }

    /// Append a reading to the bucket of its date. The backing file is flushed
    /// before this returns; on failure the in-memory append is rolled back.
    pub fn record(&self, timestamp: NaiveDateTime, power_kw: f64) -> Result<Reading, StoreError> {
        if !is_valid_power(power_kw) {
            return Err(StoreError::InvalidReading(power_kw));
        }

        // Second granularity on disk and in memory.
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        let reading = Reading::new(timestamp, power_kw);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let created = inner.push(reading);
        // Memory never runs ahead of the file
        if let Err(e) = self.persist(&inner) {
            inner.pop(reading.date(), created);
            return Err(e);
        }

        debug!("Recorded {:.3} kW at {}", power_kw, timestamp);
        Ok(reading)
    }

    /// Readings dated within the last `days` days (today inclusive), ascending.
    pub fn load(&self, days: u32) -> Vec<Reading> {
        self.load_at(days, today())
    }

    /// `load` relative to an explicit `today` (for testing and replay).
    pub fn load_at(&self, days: u32, today: NaiveDate) -> Vec<Reading> {
        let span = u64::from(days.max(1) - 1);
        let start = today.checked_sub_days(Days::new(span)).unwrap_or(NaiveDate::MIN);
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.collect_range(start, today)
    }

    /// Every retained reading, ascending.
    pub fn load_all(&self) -> Vec<Reading> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.collect_range(NaiveDate::MIN, NaiveDate::MAX)
    }

    /// Read-only passthrough to `load` for export tooling.
    pub fn export_range(&self, days: u32) -> Vec<Reading> {
        self.load(days)
    }

    /// Drop every bucket strictly older than `today - retention_days`.
    /// Returns the number of buckets removed.
    pub fn prune(&self, retention_days: u32) -> Result<usize, StoreError> {
        self.prune_at(retention_days, today())
    }

    pub fn prune_at(&self, retention_days: u32, today: NaiveDate) -> Result<usize, StoreError> {
        let policy = RetentionPolicy::new(retention_days)?;
        let horizon = policy.horizon(today);

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let removed = inner.retain_from(horizon);
        // Nothing expired, nothing to rewrite
        if removed > 0 {
            self.persist(&inner)?;
            info!(
                "Pruned {} day(s) of energy data older than {} (retention {} days)",
                removed,
                horizon,
                policy.days()
            );
        }
        Ok(removed)
    }

    /// Change the retention horizon and prune immediately.
    pub fn set_retention(&self, retention_days: u32) -> Result<usize, StoreError> {
        let policy = RetentionPolicy::new(retention_days)?;
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.retention = policy;
        }
        self.prune(retention_days)
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .retention
    }

    /// Dates that currently hold a bucket, in bucket order.
    pub fn bucket_dates(&self) -> Vec<NaiveDate> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.buckets.iter().map(|bucket| bucket.date).collect()
    }

    /// Copy the backing document to `destination` while holding off writers.
    pub fn copy_backing_file(&self, destination: &Path) -> Result<(), StoreError> {
        let _guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        fs::copy(&self.path, destination)
            .map(|_| ())
            .map_err(|e| StoreError::Persistence {
                path: destination.display().to_string(),
                source: e,
            })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking: callers on the runtime go through `spawn_blocking`.
    fn persist(&self, inner: &StoreInner) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Persistence {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        // Atomic write: stream compact JSON into a temp file, sync, then rename
        let temp_path = self.path.with_extension("json.tmp");
        {
            let file = fs::File::create(&temp_path).map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &inner.to_document())?;
            writer.flush().map_err(io_err)?;
            writer
                .into_inner()
                .map_err(|e| io_err(e.into_error()))?
                .sync_all()
                .map_err(io_err)?;
        }
        fs::rename(&temp_path, &self.path).map_err(io_err)
    }
}

fn parse_document(contents: &str) -> Result<EnergyDocument, StoreError> {
    serde_json::from_str(contents).map_err(|e| StoreError::CorruptData(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(day: NaiveDate, h: u32, m: u32, s: u32) -> NaiveDateTime {
        day.and_hms_opt(h, m, s).unwrap()
    }

    fn open_store(dir: &Path, today: NaiveDate) -> TimeSeriesStore {
        TimeSeriesStore::open_at(&dir.join("energy_data.json"), 30, today).unwrap()
    }

    #[test]
    fn test_open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("energy_data.json");

        let store = TimeSeriesStore::open(&path, 30).unwrap();
        assert!(path.exists());
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_replaced_with_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("energy_data.json");
        fs::write(&path, "<energy_data><day date=").unwrap();

        let store = TimeSeriesStore::open(&path, 30).unwrap();
        assert!(store.load_all().is_empty());

        // The file on disk was rewritten and parses again.
        let contents = fs::read_to_string(&path).unwrap();
        assert!(parse_document(&contents).is_ok());
    }

    #[test]
    fn test_record_is_durable_across_reopen() {
        let dir = tempdir().unwrap();
        let today = today();
        let store = open_store(dir.path(), today);
        store.record(at(today, 9, 0, 0), 4.0).unwrap();
        store.record(at(today, 10, 0, 0), 2.5).unwrap();
        drop(store);

        let reopened = open_store(dir.path(), today);
        let readings = reopened.load(1);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].power_kw, 4.0);
        assert_eq!(readings[1].timestamp, at(today, 10, 0, 0));
    }

    #[test]
    fn test_backing_file_is_compact() {
        let dir = tempdir().unwrap();
        let day = date(2026, 3, 14);
        let store = open_store(dir.path(), day);
        for minute in 0..10 {
            store.record(at(day, 8, minute, 0), 1.0).unwrap();
        }

        let contents = fs::read_to_string(store.path()).unwrap();
        assert!(!contents.contains('\n'));
        assert!(!contents.contains("  "));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_on_disk_schema() {
        let dir = tempdir().unwrap();
        let day = date(2026, 3, 14);
        let store = open_store(dir.path(), day);
        store.record(at(day, 8, 15, 30), 1.5).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(value["days"][0]["date"], "2026-03-14");
        assert_eq!(value["days"][0]["power"][0]["time"], "08:15:30");
        assert_eq!(value["days"][0]["power"][0]["value"], 1.5);
    }

    #[test]
    fn test_subsecond_precision_is_dropped() {
        let dir = tempdir().unwrap();
        let day = date(2026, 3, 14);
        let store = open_store(dir.path(), day);
        let precise = at(day, 8, 0, 0).with_nanosecond(750_000_000).unwrap();

        let reading = store.record(precise, 1.0).unwrap();
        assert_eq!(reading.timestamp, at(day, 8, 0, 0));
    }

    #[test]
    fn test_invalid_power_rejected() {
        let dir = tempdir().unwrap();
        let day = date(2026, 3, 14);
        let store = open_store(dir.path(), day);

        assert!(matches!(
            store.record(at(day, 8, 0, 0), -1.0),
            Err(StoreError::InvalidReading(_))
        ));
        assert!(store.record(at(day, 8, 0, 0), f64::NAN).is_err());
        assert!(store.load_all().is_empty());
    }

    #[test]
    fn test_persistence_failure_is_reported_and_rolled_back() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let day = date(2026, 3, 14);
        let store = TimeSeriesStore::open_at(&data_dir.join("energy.json"), 30, day).unwrap();
        store.record(at(day, 8, 0, 0), 1.0).unwrap();

        // Replace the data directory with a plain file so the next write fails.
        fs::remove_dir_all(&data_dir).unwrap();
        fs::write(&data_dir, "not a directory").unwrap();

        let result = store.record(at(day, 9, 0, 0), 2.0);
        assert!(matches!(result, Err(StoreError::Persistence { .. })));
        assert_eq!(store.load_at(1, day).len(), 1);

        let next_day = date(2026, 3, 15);
        assert!(store.record(at(next_day, 9, 0, 0), 2.0).is_err());
        assert_eq!(store.bucket_dates(), vec![day]);
    }

    #[test]
    fn test_load_sorts_out_of_order_readings_and_keeps_ties_stable() {
        let dir = tempdir().unwrap();
        let day = date(2026, 6, 1);
        let store = open_store(dir.path(), day);
        store.record(at(day, 12, 0, 0), 3.0).unwrap();
        store.record(at(day, 9, 0, 0), 1.0).unwrap();
        store.record(at(day, 9, 0, 0), 2.0).unwrap();

        let powers: Vec<f64> = store.load_at(1, day).iter().map(|r| r.power_kw).collect();
        assert_eq!(powers, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_load_window_bounds() {
        let dir = tempdir().unwrap();
        let today = date(2026, 6, 10);
        let store = open_store(dir.path(), today);
        for offset in 0..5u64 {
            let day = today.checked_sub_days(Days::new(offset)).unwrap();
            store.record(at(day, 12, 0, 0), offset as f64).unwrap();
        }

        assert_eq!(store.load_at(1, today).len(), 1);
        assert_eq!(store.load_at(3, today).len(), 3);
        assert_eq!(store.load_at(100, today).len(), 5);
        // Zero is treated as today only.
        assert_eq!(store.load_at(0, today).len(), 1);
        assert_eq!(store.load_at(u32::MAX, today).len(), 5);
    }

    #[test]
    fn test_one_bucket_per_date() {
        let dir = tempdir().unwrap();
        let day = date(2026, 6, 1);
        let store = open_store(dir.path(), day);
        store.record(at(day, 8, 0, 0), 1.0).unwrap();
        store.record(at(day, 9, 0, 0), 1.0).unwrap();
        store.record(at(date(2026, 6, 2), 0, 0, 1), 1.0).unwrap();

        assert_eq!(store.bucket_dates(), vec![day, date(2026, 6, 2)]);
    }

    #[test]
    fn test_duplicate_dates_in_file_are_merged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("energy_data.json");
        fs::write(
            &path,
            r#"{"days":[
                {"date":"2026-06-01","power":[{"time":"08:00:00","value":1.0}]},
                {"date":"2026-06-01","power":[{"time":"09:00:00","value":2.0}]}
            ]}"#,
        )
        .unwrap();

        let store = TimeSeriesStore::open_at(&path, 30, date(2026, 6, 1)).unwrap();
        assert_eq!(store.bucket_dates().len(), 1);
        assert_eq!(store.load_at(1, date(2026, 6, 1)).len(), 2);
    }

    #[test]
    fn test_open_prunes_expired_days() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("energy_data.json");
        fs::write(
            &path,
            r#"{"days":[
                {"date":"2026-01-01","power":[{"time":"08:00:00","value":1.0}]},
                {"date":"2026-06-01","power":[{"time":"08:00:00","value":2.0}]}
            ]}"#,
        )
        .unwrap();

        let store = TimeSeriesStore::open_at(&path, 30, date(2026, 6, 10)).unwrap();
        assert_eq!(store.bucket_dates(), vec![date(2026, 6, 1)]);
    }

    #[test]
    fn test_prune_boundary_is_strict() {
        let dir = tempdir().unwrap();
        let today = date(2026, 6, 10);
        let store = open_store(dir.path(), today);
        store.record(at(date(2026, 6, 3), 12, 0, 0), 1.0).unwrap();
        store.record(at(date(2026, 6, 2), 12, 0, 0), 1.0).unwrap();

        // Horizon is 2026-06-03: that day survives, the day before does not.
        assert_eq!(store.prune_at(7, today).unwrap(), 1);
        assert_eq!(store.bucket_dates(), vec![date(2026, 6, 3)]);
    }

    #[test]
    fn test_set_retention_prunes_immediately() {
        let dir = tempdir().unwrap();
        let today = today();
        let store = open_store(dir.path(), today);
        let old = today.checked_sub_days(Days::new(10)).unwrap();
        store.record(at(old, 12, 0, 0), 1.0).unwrap();
        store.record(at(today, 12, 0, 0), 1.0).unwrap();

        assert_eq!(store.set_retention(5).unwrap(), 1);
        assert_eq!(store.retention().days(), 5);
        assert_eq!(store.bucket_dates(), vec![today]);
        assert!(matches!(store.set_retention(0), Err(StoreError::InvalidRetention(0))));
    }

    #[test]
    fn test_copy_backing_file() {
        let dir = tempdir().unwrap();
        let day = date(2026, 6, 1);
        let store = open_store(dir.path(), day);
        store.record(at(day, 8, 0, 0), 1.0).unwrap();

        let destination = dir.path().join("copy.json");
        store.copy_backing_file(&destination).unwrap();
        assert_eq!(
            fs::read_to_string(&destination).unwrap(),
            fs::read_to_string(store.path()).unwrap()
        );
    }

    // Strategy: (day offset back from today, seconds into the day, power)
    fn reading_strategy() -> impl Strategy<Value = (u64, u32, f64)> {
        (0u64..60, 0u32..86_400, 0.0f64..50.0)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        #[test]
        fn prop_prune_respects_horizon_and_is_idempotent(
            readings in prop::collection::vec(reading_strategy(), 0..40),
            retention in 1u32..45,
        ) {
            let dir = tempdir().unwrap();
            let today = date(2026, 8, 31);
            let store = TimeSeriesStore::open_at(&dir.path().join("e.json"), 365, today).unwrap();
            for (offset, secs, power) in &readings {
                let day = today.checked_sub_days(Days::new(*offset)).unwrap();
                let time = NaiveTime::from_num_seconds_from_midnight_opt(*secs, 0).unwrap();
                store.record(day.and_time(time), *power).unwrap();
            }

            store.prune_at(retention, today).unwrap();
            let horizon = RetentionPolicy::new(retention).unwrap().horizon(today);
            for bucket_date in store.bucket_dates() {
                prop_assert!(bucket_date >= horizon);
            }

            let survivors = store.bucket_dates();
            prop_assert_eq!(store.prune_at(retention, today).unwrap(), 0);
            prop_assert_eq!(store.bucket_dates(), survivors);
        }

        #[test]
        fn prop_load_is_sorted_and_monotonic_in_days(
            readings in prop::collection::vec(reading_strategy(), 0..40),
        ) {
            let dir = tempdir().unwrap();
            let today = date(2026, 8, 31);
            let store = TimeSeriesStore::open_at(&dir.path().join("e.json"), 365, today).unwrap();
            for (offset, secs, power) in &readings {
                let day = today.checked_sub_days(Days::new(*offset)).unwrap();
                let time = NaiveTime::from_num_seconds_from_midnight_opt(*secs, 0).unwrap();
                store.record(day.and_time(time), *power).unwrap();
            }

            let mut previous: Vec<Reading> = Vec::new();
            for days in 1..=61u32 {
                let current = store.load_at(days, today);
                prop_assert!(current.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
                for reading in &previous {
                    prop_assert!(current.contains(reading));
                }
                prop_assert!(current.len() >= previous.len());
                previous = current;
            }
            prop_assert_eq!(previous.len(), readings.len());
        }
    }
}
