//! File-based store of precomputed operation results.
//!
//! Entries live at `<root>/<region>/<operation>/<forecast date>_<cache key>.json` and hold the
//! result together with its generation time and the watermark of the source files it was
//! computed from. An entry is fresh while its modification time is not older than the newest
//! source file of its forecast run.
//!
//! Entries are written to a temporary file that is then renamed over the final path, so readers
//! never see a partial entry. Writers serialise on a lock file next to the entry.

use crate::dataset::DataSource;
use crate::error::ForecastError;
use crate::layout;
use crate::metrics::record_warm_lookup;
use crate::operation::{Cacheable, Operation};
use crate::types::ForecastKey;

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the store directory inside the data directory.
pub const DEFAULT_DIR_NAME: &str = ".prebuilt_cache";

/// Content of an entry.
#[derive(Debug, Deserialize, Serialize)]
pub struct WarmEntry<T> {
    pub generated_at: DateTime<Utc>,
    /// Modification time of the newest source file, in seconds since the Unix epoch
    pub source_watermark: f64,
    pub result: T,
}

/// Outcome of [WarmCacheStore::refresh].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Refresh {
    /// The entry was (re)generated.
    Built,
    /// The entry was already fresh.
    UpToDate,
    /// The forecast run has no source files.
    NoSources,
}

/// An advisory lock held by creating a file exclusively.
///
/// The file holds the process id of its owner and is removed when the handle is dropped.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
}

impl LockHandle {
    /// Acquires the lock at `path`, polling every `poll` until `timeout` elapses.
    ///
    /// Lock files older than `stale_after` are assumed to be left over by a crashed worker and
    /// are removed, see [LockHandle::break_stale]. Waiting is approximate: the deadline is only
    /// checked between polls.
    pub fn acquire(
        path: &Path,
        timeout: Duration,
        poll: Duration,
        stale_after: Option<Duration>,
    ) -> Result<Self, ForecastError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let handle = Self {
                        path: path.to_path_buf(),
                    };
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(handle);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(stale_after) = stale_after {
                        if Self::is_stale(path, stale_after) {
                            Self::break_stale(path, stale_after)?;
                            continue;
                        }
                    }
                    if started.elapsed() >= timeout {
                        return Err(ForecastError::LockBusy {
                            path: path.display().to_string(),
                        });
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Removes the lock at `path`, seen stale a moment ago.
    ///
    /// The lock is first renamed to a name unique to this call, so of several workers racing on
    /// the same stale lock exactly one moves it. If the moved file is no longer stale, another
    /// worker recreated the lock in between and it is linked back in place.
    fn break_stale(path: &Path, stale_after: Duration) -> Result<(), ForecastError> {
        static TOMBSTONES: AtomicUsize = AtomicUsize::new(0);
        let mut name = path.as_os_str().to_owned();
        name.push(format!(
            ".stale.{}.{}",
            std::process::id(),
            TOMBSTONES.fetch_add(1, Ordering::Relaxed)
        ));
        let tombstone = PathBuf::from(name);
        match fs::rename(path, &tombstone) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if Self::is_stale(&tombstone, stale_after) {
            tracing::warn!(path = %path.display(), "removed stale lock");
        } else if let Err(error) = fs::hard_link(&tombstone, path) {
            tracing::error!(path = %path.display(), %error, "failed to restore live lock");
        }
        if let Err(error) = fs::remove_file(&tombstone) {
            tracing::warn!(path = %tombstone.display(), %error, "failed to remove stale lock");
        }
        Ok(())
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map_or(false, |age| age > stale_after)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), %error, "failed to release lock");
        }
    }
}

/// Writes `bytes` to `path` through a temporary file in the same directory.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ForecastError> {
    let parent = path
        .parent()
        .ok_or_else(|| ForecastError::invalid("path", path.display().to_string()))?;
    fs::create_dir_all(parent)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let tmp = parent.join(format!(".{name}.tmp.{}", std::process::id()));
    let written = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(error) = written {
        let _ = fs::remove_file(&tmp);
        return Err(error.into());
    }
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The store of precomputed results.
#[derive(Clone, Debug)]
pub struct WarmCacheStore {
    root: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
    stale_lock_after: Option<Duration>,
}

impl WarmCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(5),
            lock_poll: Duration::from_millis(100),
            stale_lock_after: Some(Duration::from_secs(600)),
        }
    }

    /// The store of a data directory.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(DEFAULT_DIR_NAME))
    }

    /// Sets how long and how often writers wait for the lock of an entry.
    pub fn with_lock_timing(mut self, timeout: Duration, poll: Duration) -> Self {
        self.lock_timeout = timeout;
        self.lock_poll = poll;
        self
    }

    /// Sets the age after which a lock file is considered abandoned, or `None` to keep lock
    /// files forever.
    pub fn with_stale_lock_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_lock_after = stale_after;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(
        &self,
        key: &ForecastKey,
        operation_name: &str,
        cache_key: &str,
    ) -> Result<PathBuf, ForecastError> {
        let region = &key.region;
        if region.is_empty() || region.contains(['/', '\\']) || region.starts_with('.') {
            return Err(ForecastError::invalid("region", format!("{region:?}")));
        }
        Ok(self
            .root
            .join(region)
            .join(operation_name)
            .join(format!("{}_{cache_key}.json", key.forecast_date)))
    }

    /// Returns the entry path of an operation, or `None` if the operation does not derive from a
    /// single forecast run.
    pub fn entry_path<O: Operation>(&self, op: &O) -> Result<Option<PathBuf>, ForecastError> {
        op.forecast_key()
            .map(|key| self.path_for(&key, O::NAME, &op.cache_key()))
            .transpose()
    }

    fn lock_path(entry: &Path) -> PathBuf {
        let mut name = entry.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Modification time of the newest source file of a forecast run.
    pub fn watermark(
        &self,
        source: &DataSource,
        key: &ForecastKey,
    ) -> Result<Option<SystemTime>, ForecastError> {
        let region_path = source.region_path(&key.region)?;
        layout::latest_source_mtime(&region_path, &key.forecast_date)
    }

    /// Whether the entry at `path` exists and is not older than `watermark`.
    pub fn is_fresh(path: &Path, watermark: SystemTime) -> bool {
        fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .map_or(false, |modified| modified >= watermark)
    }

    /// Reads the entry at `path`.
    pub fn read<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<WarmEntry<T>, ForecastError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Writes an entry, holding its lock while writing.
    pub fn write<T: Serialize>(
        &self,
        path: &Path,
        watermark: SystemTime,
        result: &T,
    ) -> Result<(), ForecastError> {
        let _lock = self.lock(path)?;
        self.write_unlocked(path, watermark, result)
    }

    fn lock(&self, path: &Path) -> Result<LockHandle, ForecastError> {
        LockHandle::acquire(
            &Self::lock_path(path),
            self.lock_timeout,
            self.lock_poll,
            self.stale_lock_after,
        )
    }

    fn write_unlocked<T: Serialize>(
        &self,
        path: &Path,
        watermark: SystemTime,
        result: &T,
    ) -> Result<(), ForecastError> {
        let entry = WarmEntry {
            generated_at: Utc::now(),
            source_watermark: epoch_seconds(watermark),
            result,
        };
        write_atomic(path, &serde_json::to_vec(&entry)?)
    }

    /// Returns the stored result of an operation if its entry is fresh.
    ///
    /// Any problem reading the entry or the sources is treated as an absent entry, so that the
    /// caller computes the result itself.
    pub fn lookup<O: Operation>(&self, source: &DataSource, op: &O) -> Option<O::Output> {
        let key = op.forecast_key()?;
        let path = match self.path_for(&key, O::NAME, &op.cache_key()) {
            Ok(path) => path,
            Err(_) => return None,
        };
        if !path.is_file() {
            record_warm_lookup("absent");
            return None;
        }
        let watermark = match self.watermark(source, &key) {
            Ok(Some(watermark)) => watermark,
            Ok(None) | Err(_) => {
                record_warm_lookup("stale");
                return None;
            }
        };
        if !Self::is_fresh(&path, watermark) {
            record_warm_lookup("stale");
            return None;
        }
        match Self::read::<O::Output>(&path) {
            Ok(entry) => {
                record_warm_lookup("fresh");
                Some(entry.result)
            }
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "unreadable warm cache entry");
                record_warm_lookup("absent");
                None
            }
        }
    }

    /// Regenerates the entry of an operation unless it is fresh.
    ///
    /// Fails with [ForecastError::LockBusy] when another worker holds the entry's lock past the
    /// lock timeout. The lock is released whatever the outcome.
    pub fn refresh<O: Operation>(
        &self,
        source: &DataSource,
        op: &O,
    ) -> Result<Refresh, ForecastError> {
        let key = op.forecast_key().ok_or_else(|| {
            ForecastError::invalid("operation", format!("{} has no forecast run", O::NAME))
        })?;
        let path = self.path_for(&key, O::NAME, &op.cache_key())?;
        let Some(watermark) = self.watermark(source, &key)? else {
            return Ok(Refresh::NoSources);
        };
        if Self::is_fresh(&path, watermark) {
            return Ok(Refresh::UpToDate);
        }

        let _lock = self.lock(&path)?;
        // Another worker may have built the entry while we waited.
        if Self::is_fresh(&path, watermark) {
            return Ok(Refresh::UpToDate);
        }
        let result = op.execute(source)?;
        self.write_unlocked(&path, watermark, &result)?;
        Ok(Refresh::Built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::operations::aggregations::{
        EntitiesAnalogValuesPercentile, SeriesSynthesisPerMethod,
    };
    use crate::operations::general::LastForecastDate;
    use crate::test_utils::{self, TestData};
    use crate::types::TargetSelector;

    fn store(data: &TestData) -> WarmCacheStore {
        WarmCacheStore::in_data_dir(data.dir.path())
            .with_lock_timing(Duration::from_millis(50), Duration::from_millis(10))
    }

    fn synthesis() -> SeriesSynthesisPerMethod {
        SeriesSynthesisPerMethod {
            region: "adn".to_string(),
            forecast_date: test_utils::forecast_date(),
            percentile: 90,
            normalize: None,
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn entry_layout() {
        let data = TestData::new();
        let store = store(&data);
        let op = synthesis();
        let path = store.entry_path(&op).unwrap().unwrap();
        let expected = data
            .dir
            .path()
            .join(".prebuilt_cache/adn/series_synthesis_per_method")
            .join(format!("2024-10-05T00_{}.json", op.cache_key()));
        assert_eq!(expected, path);
        let general = LastForecastDate {
            region: "adn".to_string(),
        };
        assert_eq!(None, store.entry_path(&general).unwrap());
    }

    #[test]
    fn refresh_then_lookup() {
        let data = TestData::new();
        let store = store(&data);
        let op = synthesis();
        assert!(store.lookup(&data.source, &op).is_none());
        assert_eq!(Refresh::Built, store.refresh(&data.source, &op).unwrap());
        assert_eq!(Refresh::UpToDate, store.refresh(&data.source, &op).unwrap());

        // Values are rounded when stored.
        let cached = store.lookup(&data.source, &op).unwrap();
        assert_eq!(
            serde_json::to_value(op.execute(&data.source).unwrap()).unwrap(),
            serde_json::to_value(cached).unwrap()
        );

        let path = store.entry_path(&op).unwrap().unwrap();
        let entry = WarmCacheStore::read::<serde_json::Value>(&path).unwrap();
        assert!(entry.source_watermark > 0.0);
        assert_eq!(
            vec![path.file_name().unwrap().to_string_lossy().into_owned()],
            dir_entries(path.parent().unwrap())
        );
    }

    #[test]
    fn newer_source_invalidates() {
        let data = TestData::new();
        let store = store(&data);
        let op = synthesis();
        store.refresh(&data.source, &op).unwrap();
        let source = File::options()
            .write(true)
            .open(data.path("2Z-GFS", "Alpes_Tessin"))
            .unwrap();
        source
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();
        assert!(store.lookup(&data.source, &op).is_none());
        assert_eq!(Refresh::Built, store.refresh(&data.source, &op).unwrap());
    }

    #[test]
    fn missing_sources() {
        let data = TestData::new();
        let store = store(&data);
        let op = SeriesSynthesisPerMethod {
            forecast_date: "2024-10-05T12".parse().unwrap(),
            ..synthesis()
        };
        assert_eq!(Refresh::NoSources, store.refresh(&data.source, &op).unwrap());
    }

    #[test]
    fn lock_released_on_failure() {
        let data = TestData::new();
        let store = store(&data);
        let op = EntitiesAnalogValuesPercentile {
            region: "adn".to_string(),
            forecast_date: test_utils::forecast_date(),
            method: "unknown".to_string(),
            target: TargetSelector::LeadTime(24),
            percentile: 90,
            normalize: None,
        };
        assert!(store.refresh(&data.source, &op).unwrap_err().is_not_found());
        let path = store.entry_path(&op).unwrap().unwrap();
        assert!(!path.exists());
        assert!(!WarmCacheStore::lock_path(&path).exists());
    }

    #[test]
    fn busy_lock() {
        let data = TestData::new();
        let store = store(&data);
        let op = synthesis();
        let path = store.entry_path(&op).unwrap().unwrap();
        let held = store.lock(&path).unwrap();
        let pid = fs::read_to_string(held.path()).unwrap();
        assert_eq!(std::process::id().to_string(), pid.trim());

        let started = Instant::now();
        assert!(matches!(
            store.refresh(&data.source, &op),
            Err(ForecastError::LockBusy { .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(!path.exists());

        drop(held);
        assert_eq!(Refresh::Built, store.refresh(&data.source, &op).unwrap());
    }

    #[test]
    fn stale_lock_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json.lock");
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        let timeout = Duration::from_millis(20);
        let poll = Duration::from_millis(5);
        assert!(LockHandle::acquire(&path, timeout, poll, None).is_err());
        let lock =
            LockHandle::acquire(&path, timeout, poll, Some(Duration::from_secs(60))).unwrap();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn stale_lock_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json.lock");
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        let started = &std::sync::Barrier::new(2);
        let finished = &std::sync::Barrier::new(2);
        let path = path.as_path();
        let acquired = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(move |_| {
                    scope.spawn(move || {
                        started.wait();
                        let lock = LockHandle::acquire(
                            path,
                            Duration::from_millis(200),
                            Duration::from_millis(5),
                            Some(Duration::from_secs(60)),
                        );
                        // The winner holds the lock until the other worker gave up.
                        finished.wait();
                        lock.is_ok()
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .filter(|&acquired| acquired)
                .count()
        });
        assert_eq!(1, acquired);
        assert!(dir_entries(dir.path()).is_empty());
    }

    #[test]
    fn recreated_lock_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json.lock");
        fs::write(&path, "42\n").unwrap();
        // Seen stale, but another worker replaced it with a live lock since.
        LockHandle::break_stale(&path, Duration::from_secs(60)).unwrap();
        assert_eq!("42\n", fs::read_to_string(&path).unwrap());
        assert_eq!(vec!["entry.json.lock".to_string()], dir_entries(dir.path()));

        LockHandle::break_stale(&dir.path().join("gone.lock"), Duration::from_secs(60)).unwrap();
    }

    #[test]
    fn atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!("second", fs::read_to_string(&path).unwrap());
        assert_eq!(vec!["b.json"], dir_entries(path.parent().unwrap()));
    }

    #[test]
    fn corrupt_entry_is_absent() {
        let data = TestData::new();
        let store = store(&data);
        let op = synthesis();
        let path = store.entry_path(&op).unwrap().unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{").unwrap();
        assert!(store.lookup(&data.source, &op).is_none());
    }
}
