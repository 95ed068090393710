use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::models::CachedResponse;
use crate::error::CacheError;

/// Outcome of a cache read. `Corrupt` is surfaced so the coordinator can
/// unlink the artifact before refetching.
#[derive(Debug)]
pub enum CacheLookup {
    Hit(Box<CachedResponse>),
    Miss,
    Corrupt,
}

/// The single on-disk XConf artifact.
///
/// Writers stage to a sibling temp file and atomically rename while holding
/// an advisory lock; readers rely on rename atomicity and never lock.
pub struct XconfCache {
    path: PathBuf,
    lock_path: PathBuf,
    ttl: Duration,
    /// With a zero TTL the artifact found at startup is considered stale
    /// until this daemon has refreshed it once.
    refreshed_this_run: AtomicBool,
}

impl XconfCache {
    pub fn new(path: PathBuf, lock_path: PathBuf, ttl: Duration) -> Self {
        XconfCache {
            path,
            lock_path,
            ttl,
            refreshed_this_run: AtomicBool::new(false),
        }
    }

    pub fn read(&self) -> CacheLookup {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return CacheLookup::Miss,
            Err(err) => {
                warn!(path = ?self.path, %err, "catalog cache unreadable");
                return CacheLookup::Miss;
            }
        };
        let record: CachedResponse = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = ?self.path, %err, "catalog cache corrupt");
                return CacheLookup::Corrupt;
            }
        };
        if self.is_stale(&record) {
            debug!(path = ?self.path, "catalog cache stale");
            return CacheLookup::Miss;
        }
        CacheLookup::Hit(Box::new(record))
    }

    fn is_stale(&self, record: &CachedResponse) -> bool {
        if self.ttl.is_zero() {
            return !self.refreshed_this_run.load(Ordering::SeqCst);
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now.saturating_sub(record.fetched_at) > self.ttl.as_secs()
    }

    /// Atomically replaces the artifact: write `<path>.tmp`, flush, rename.
    /// An exclusive flock on the sibling lock file serializes writers
    /// across processes.
    pub fn store(&self, record: &CachedResponse) -> Result<(), CacheError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| CacheError::Io {
                path: self.lock_path.clone(),
                source,
            })?;
        let _lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock).map_err(|_| {
            CacheError::Locked {
                path: self.lock_path.clone(),
            }
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(record).map_err(|source| CacheError::Corrupt {
            path: tmp_path.clone(),
            source,
        })?;

        let io_err = |path: &PathBuf| {
            let path = path.clone();
            move |source| CacheError::Io { path, source }
        };
        let mut tmp = fs::File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        tmp.write_all(&payload).map_err(io_err(&tmp_path))?;
        tmp.flush().map_err(io_err(&tmp_path))?;
        tmp.sync_all().map_err(io_err(&tmp_path))?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).map_err(io_err(&self.path))?;

        self.refreshed_this_run.store(true, Ordering::SeqCst);
        debug!(path = ?self.path, "catalog cache replaced");
        Ok(())
    }

    /// Unlinks the artifact (explicit invalidation, or corrupt cleanup).
    pub fn invalidate(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "catalog cache invalidated"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = ?self.path, %err, "could not invalidate catalog cache"),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Current time as unix seconds, for the `fetchedAt` envelope field.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
