//! Durable cooldown marker and the cross-process run lease.
//!
//! The marker holds the epoch seconds of the last successful power cycle. A
//! sibling `.lock` file is held for the whole of a run so that a server and a
//! cron-invoked CLI never read the marker while the other is mid-cycle.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Cooldown marker error types.
#[derive(Error, Debug)]
pub enum CooldownError {
    #[error("cooldown marker I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of wall-clock time for cooldown arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// File-backed cooldown marker.
#[derive(Debug, Clone)]
pub struct CooldownMarker {
    path: PathBuf,
    lock_path: PathBuf,
    lease_ttl: Duration,
}

/// Exclusive right to run a remediation; released on drop.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    stamp: String,
}

impl Drop for RunLease {
    fn drop(&mut self) {
        // A lease taken over as stale belongs to someone else now
        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.stamp => {}
            Ok(_) => {
                tracing::warn!("Run lease {} was taken over, leaving it", self.path.display());
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(_) => {}
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!("Failed to release run lease {}: {}", self.path.display(), e);
            }
        }
    }
}

impl CooldownMarker {
    /// `lease_ttl` bounds how long a lease left behind by a crashed process blocks new runs.
    pub fn new<P: AsRef<Path>>(path: P, lease_ttl: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lease_ttl,
        }
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> CooldownError {
        CooldownError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Try to take the run lease. `Ok(None)` means another run holds it.
    pub fn try_lease(&self, now: DateTime<Utc>) -> Result<Option<RunLease>, CooldownError> {
        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(parent, e))?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&self.lock_path) {
                Ok(mut file) => {
                    let stamp = format!("{} {}\n", now.timestamp(), std::process::id());
                    file.write_all(stamp.as_bytes())
                        .map_err(|e| self.io_err(&self.lock_path, e))?;
                    return Ok(Some(RunLease {
                        path: self.lock_path.clone(),
                        stamp,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !self.lease_is_stale(&self.lock_path, now) || !self.take_over(now)? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(self.io_err(&self.lock_path, e)),
            }
        }
        // Lost the takeover race to another process
        Ok(None)
    }

    /// Move the lock file aside and keep it removed only if what was moved is
    /// still stale. Returns `false` when a live lease was grabbed and restored.
    fn take_over(&self, now: DateTime<Utc>) -> Result<bool, CooldownError> {
        let mut aside_name = self.lock_path.file_name().unwrap_or_default().to_os_string();
        aside_name.push(format!(".stale.{}", std::process::id()));
        let aside = self.lock_path.with_file_name(aside_name);

        match fs::rename(&self.lock_path, &aside) {
            Ok(()) => {}
            // Someone else already moved it; race for the fresh create
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(self.io_err(&self.lock_path, e)),
        }

        let stale = self.lease_is_stale(&aside, now);
        if stale {
            tracing::warn!(
                "Taking over stale run lease {} (older than {:?})",
                self.lock_path.display(),
                self.lease_ttl
            );
        } else if let Err(e) = fs::hard_link(&aside, &self.lock_path) {
            // Only fails when yet another lease exists, which then stands
            tracing::warn!("Could not restore run lease {}: {}", self.lock_path.display(), e);
        }
        if let Err(e) = fs::remove_file(&aside) {
            tracing::warn!("Failed to remove {}: {}", aside.display(), e);
        }
        Ok(stale)
    }

    fn lease_is_stale(&self, path: &Path, now: DateTime<Utc>) -> bool {
        let taken_at = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.split_whitespace().next()?.parse::<i64>().ok());
        let ttl_secs = i64::try_from(self.lease_ttl.as_secs()).unwrap_or(i64::MAX);
        match taken_at {
            Some(at) => now.timestamp().saturating_sub(at) >= ttl_secs,
            // Unreadable or half-written: only stale once the file itself is old
            None => fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age >= self.lease_ttl),
        }
    }

    #[cfg(test)]
    pub(crate) fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Epoch seconds of the last successful remediation, if any.
    ///
    /// A marker with unparseable content counts as absent.
    pub fn last_remediation(&self) -> Result<Option<i64>, CooldownError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => match content.trim().parse::<i64>() {
                Ok(epoch) => Ok(Some(epoch)),
                Err(_) => {
                    tracing::warn!(
                        "Ignoring unreadable cooldown marker {}: {:?}",
                        self.path.display(),
                        content.trim()
                    );
                    Ok(None)
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(&self.path, e)),
        }
    }

    /// Seconds left in the cooldown window at `now`, or `None` if a run may start.
    pub fn remaining(
        &self,
        now: DateTime<Utc>,
        period: Duration,
    ) -> Result<Option<u64>, CooldownError> {
        let Some(last) = self.last_remediation()? else {
            return Ok(None);
        };
        let elapsed = now.timestamp() - last;
        let period = period.as_secs() as i64;
        Ok((elapsed < period).then(|| (period - elapsed) as u64))
    }

    /// Persist `at` as the last successful remediation (write to temp, then rename).
    pub fn record(&self, at: DateTime<Utc>) -> Result<(), CooldownError> {
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);

        fs::write(&tmp, at.timestamp().to_string()).map_err(|e| self.io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(&self.path, e))?;
        tracing::info!("Cooldown marker updated to {}", at.timestamp());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Clock that only moves when told to.
    pub struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub fn new(at: DateTime<Utc>) -> Self {
            Self(Mutex::new(at))
        }

        pub fn set(&self, at: DateTime<Utc>) {
            *self.0.lock().unwrap() = at;
        }

        pub fn advance(&self, by: chrono::Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(600);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_missing_marker_allows_run() {
        let dir = tempdir().unwrap();
        let marker = CooldownMarker::new(dir.path().join("cooldown.txt"), TTL);
        assert_eq!(marker.last_remediation().unwrap(), None);
        assert_eq!(marker.remaining(t0(), Duration::from_secs(3600)).unwrap(), None);
    }

    #[test]
    fn test_record_and_remaining() {
        let dir = tempdir().unwrap();
        let marker = CooldownMarker::new(dir.path().join("cooldown.txt"), TTL);
        marker.record(t0()).unwrap();

        let period = Duration::from_secs(3600);
        assert_eq!(marker.last_remediation().unwrap(), Some(t0().timestamp()));
        assert_eq!(marker.remaining(t0() + chrono::Duration::seconds(3599), period).unwrap(), Some(1));
        assert_eq!(marker.remaining(t0() + chrono::Duration::seconds(3600), period).unwrap(), None);
        assert!(!dir.path().join("cooldown.txt.tmp").exists());
    }

    #[test]
    fn test_corrupt_marker_counts_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cooldown.txt");
        fs::write(&path, "yesterday-ish").unwrap();
        let marker = CooldownMarker::new(&path, TTL);
        assert_eq!(marker.last_remediation().unwrap(), None);
    }

    #[test]
    fn test_lease_is_exclusive_until_dropped() {
        let dir = tempdir().unwrap();
        let marker = CooldownMarker::new(dir.path().join("state/cooldown.txt"), TTL);

        let lease = marker.try_lease(t0()).unwrap();
        assert!(lease.is_some());
        assert!(marker.try_lease(t0()).unwrap().is_none());

        drop(lease);
        assert!(marker.try_lease(t0()).unwrap().is_some());
    }

    #[test]
    fn test_stale_lease_is_taken_over() {
        let dir = tempdir().unwrap();
        let marker = CooldownMarker::new(dir.path().join("cooldown.txt"), TTL);

        let abandoned = marker.try_lease(t0()).unwrap();
        std::mem::forget(abandoned);

        let later = t0() + chrono::Duration::seconds(TTL.as_secs() as i64 - 1);
        assert!(marker.try_lease(later).unwrap().is_none());

        let much_later = t0() + chrono::Duration::seconds(TTL.as_secs() as i64);
        assert!(marker.try_lease(much_later).unwrap().is_some());
    }

    #[test]
    fn test_late_takeover_restores_live_lease() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("cooldown.txt.lock");
        let marker = CooldownMarker::new(dir.path().join("cooldown.txt"), TTL);

        // Another process replaced the stale lease with a fresh one after we judged it stale
        let fresh = marker.try_lease(t0()).unwrap().unwrap();
        let content = fs::read_to_string(&lock).unwrap();

        assert!(!marker.take_over(t0()).unwrap());
        assert_eq!(fs::read_to_string(&lock).unwrap(), content);
        assert!(marker.try_lease(t0()).unwrap().is_none());
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);

        drop(fresh);
        assert!(!lock.exists());
    }

    #[test]
    fn test_dropped_lease_leaves_successor_alone() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("cooldown.txt.lock");
        let marker = CooldownMarker::new(dir.path().join("cooldown.txt"), TTL);

        let old = marker.try_lease(t0()).unwrap().unwrap();
        fs::write(&lock, "1714566000 4242\n").unwrap();

        drop(old);
        assert_eq!(fs::read_to_string(&lock).unwrap(), "1714566000 4242\n");
    }

    #[test]
    fn test_unbounded_ttl_never_goes_stale() {
        let dir = tempdir().unwrap();
        let marker = CooldownMarker::new(dir.path().join("cooldown.txt"), Duration::MAX);

        let held = marker.try_lease(t0()).unwrap();
        assert!(held.is_some());
        let far = t0() + chrono::Duration::days(3650);
        assert!(marker.try_lease(far).unwrap().is_none());
    }
}
