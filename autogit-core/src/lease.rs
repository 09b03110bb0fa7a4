//! Advisory, time-bounded leases stored next to the destination
//!
//! For each repository at a destination there are up to three sidecar files:
//! - `.autogit_<repo>.lock` only guards the short check-and-update sections
//!   below; holding it is not the lease.
//! - `.autogit_<repo>.working` is the lease. Its modification time, in common
//!   time, is when the owner started (or last refreshed) its work. The lease
//!   is live while `mtime + work_time_limit > now`.
//! - `.autogit_<repo>.lasterr` holds the text of the most recent failure.
//!
//! A crashed owner is recovered from by expiry, never by detecting the crash.

use std::io;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::debug;

use crate::clock::CommonClock;
use crate::store::{remove_if_exists, DestinationFs, LockedFile};
use crate::{Error, Result};

/// How long a working marker keeps other workers away
pub const DEFAULT_WORK_TIME_LIMIT: Duration = Duration::from_secs(60 * 60);

/// Placeholder written into an empty checkout while its first clone is queued
pub const CLONING_FILE_NAME: &str = "CLONING";

/// Name of the per-repo lock file
pub fn lock_file_name(repo: &str) -> String {
    format!(".autogit_{}.lock", repo)
}

/// Name of the per-repo working (heartbeat) marker
pub fn working_file_name(repo: &str) -> String {
    format!(".autogit_{}.working", repo)
}

/// Name of the per-repo last-error marker
pub fn last_error_file_name(repo: &str) -> String {
    format!(".autogit_{}.lasterr", repo)
}

/// Snapshot of a repository's lease files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseStatus {
    /// Common time the current owner started or refreshed its work
    pub working_since: Option<DateTime<Utc>>,
    /// Whether that work is still within the time limit
    pub live: bool,
    /// Text of the most recent failure, if it has not been cleared
    pub last_error: Option<String>,
}

/// Grants and releases leases for repositories at a destination
#[derive(Debug, Clone)]
pub struct LeaseCoordinator {
    clock: CommonClock,
    work_time_limit: TimeDelta,
}

impl LeaseCoordinator {
    /// Create a coordinator with a fixed work time limit
    pub fn new(clock: CommonClock, work_time_limit: Duration) -> Result<Self> {
        let work_time_limit = TimeDelta::from_std(work_time_limit).map_err(|_| {
            Error::Config(format!(
                "Work time limit is out of range: {:?}",
                work_time_limit
            ))
        })?;
        Ok(Self {
            clock,
            work_time_limit,
        })
    }

    /// The configured work time limit
    pub fn work_time_limit(&self) -> TimeDelta {
        self.work_time_limit
    }

    /// Take the lease for `repo` unless another owner holds a live one
    ///
    /// Returns `Ok(false)` when someone else is working; callers skip quietly.
    ///
    /// The lease is only approximately exclusive: once `work_time_limit` has
    /// passed without a refresh, another process may reclaim it even if the
    /// original owner is still running.
    ///
    /// Taking the lock file is not reentrant within a process, so callers
    /// must never run this concurrently for the same repo and destination.
    pub fn acquire_if_free(&self, fs: &dyn DestinationFs, repo: &str) -> Result<bool> {
        debug!(repo, "Checking if we can work on repo");
        let lock = fs.lock(&lock_file_name(repo))?;
        let result = self.claim_working_marker(fs, repo);
        let result = close_lock(lock, result);
        debug!(repo, result = ?result, "Work check completed");
        result
    }

    fn claim_working_marker(&self, fs: &dyn DestinationFs, repo: &str) -> Result<bool> {
        let working = working_file_name(repo);
        let modified = fs.modified(&working)?;
        let now = self.clock.now();

        match modified {
            None => {
                debug!(repo, "Creating new working file");
                fs.create(&working)?;
            }
            Some(mod_time) if mod_time + self.work_time_limit > now => {
                debug!(
                    repo,
                    mod_time = %mod_time,
                    now = %now,
                    limit = %self.work_time_limit,
                    "Other worker is still working on repo"
                );
                return Ok(false);
            }
            Some(mod_time) => {
                debug!(
                    repo,
                    mod_time = %mod_time,
                    now = %now,
                    limit = %self.work_time_limit,
                    "Other work expired on repo"
                );
            }
        }

        debug!(repo, now = %now, "Setting work common time");
        fs.set_modified(&working, now)?;
        Ok(true)
    }

    /// Give up the lease and record the outcome of the work
    ///
    /// Clears the working marker and any previous last-error marker, then
    /// writes a new last-error marker when `failure` is set. Missing markers
    /// are not errors.
    pub fn release(&self, fs: &dyn DestinationFs, repo: &str, failure: Option<&str>) -> Result<()> {
        debug!(repo, failure, "Completing work on repo");
        let lock = fs.lock(&lock_file_name(repo))?;
        let result = record_outcome(fs, repo, failure);
        let result = close_lock(lock, result);
        debug!(repo, result = ?result, "Work done completed");
        result
    }

    /// Remove the lock file itself and durably commit the removal
    ///
    /// Only used after the checkout has been deleted; it runs outside any
    /// critical section, so a crash can leave an orphan lock file behind.
    /// An orphan lock file is harmless: it is not a lease.
    pub fn remove_lock(&self, fs: &dyn DestinationFs, repo: &str) -> Result<()> {
        remove_if_exists(fs, &lock_file_name(repo))?;
        fs.sync_all()?;
        Ok(())
    }

    /// Read the lease files without taking the lock
    pub fn status(&self, fs: &dyn DestinationFs, repo: &str) -> Result<LeaseStatus> {
        let working_since = fs.modified(&working_file_name(repo))?;
        let live = working_since.is_some_and(|t| t + self.work_time_limit > self.clock.now());
        let last_error = match fs.read_to_string(&last_error_file_name(repo)) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(LeaseStatus {
            working_since,
            live,
            last_error,
        })
    }
}

fn record_outcome(fs: &dyn DestinationFs, repo: &str, failure: Option<&str>) -> Result<()> {
    remove_if_exists(fs, &working_file_name(repo))?;
    remove_if_exists(fs, &last_error_file_name(repo))?;
    if let Some(message) = failure {
        fs.write_file(&last_error_file_name(repo), message)?;
    }
    Ok(())
}

/// Close the lock file, which flushes everything done under it
pub(crate) fn close_lock<T>(lock: Box<dyn LockedFile>, result: Result<T>) -> Result<T> {
    let closed = lock.close();
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            debug!(error = %close_err, "Lock close error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::clock::{FixedOffset, NoOffset};
    use crate::store::LocalDir;
    use std::sync::Arc;
    use tempfile::TempDir;

    const HOUR: i64 = 60 * 60;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    /// A simulated process: its own skewed clock plus a known offset
    struct Process {
        clock: Arc<ManualClock>,
        lease: LeaseCoordinator,
    }

    impl Process {
        fn new(reference: i64, skew: i64, offset_known: bool) -> Self {
            let clock = Arc::new(ManualClock::new(at(reference + skew)));
            let common = if offset_known {
                CommonClock::new(clock.clone(), Arc::new(FixedOffset(TimeDelta::seconds(skew))))
            } else {
                CommonClock::new(clock.clone(), Arc::new(NoOffset))
            };
            Self {
                clock,
                lease: LeaseCoordinator::new(common, DEFAULT_WORK_TIME_LIMIT).unwrap(),
            }
        }
    }

    fn dest() -> (TempDir, LocalDir) {
        let tmp = TempDir::new().unwrap();
        let dir = LocalDir::new(tmp.path());
        (tmp, dir)
    }

    #[test]
    fn test_acquire_free_lease_creates_marker() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);

        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        assert_eq!(fs.modified(&working_file_name("proj")).unwrap(), Some(at(1_000_000)));
        assert!(fs.exists(&lock_file_name("proj")).unwrap());
    }

    #[test]
    fn test_live_lease_denies_second_acquire() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);

        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        p.clock.advance(TimeDelta::seconds(HOUR - 1));
        assert!(!p.lease.acquire_if_free(&fs, "proj").unwrap());
        // Denial must not refresh the marker.
        assert_eq!(fs.modified(&working_file_name("proj")).unwrap(), Some(at(1_000_000)));
    }

    #[test]
    fn test_leases_are_per_repo() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);
        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        assert!(p.lease.acquire_if_free(&fs, "other").unwrap());
    }

    #[test]
    fn test_skewed_processes_exclude_each_other() {
        let (_tmp, fs) = dest();
        let ahead = Process::new(1_000_000, 20 * 60, true);
        let behind = Process::new(1_000_000, -35 * 60, true);

        assert!(ahead.lease.acquire_if_free(&fs, "proj").unwrap());
        assert!(!behind.lease.acquire_if_free(&fs, "proj").unwrap());

        // Still inside the limit in common time.
        ahead.clock.advance(TimeDelta::seconds(HOUR - 60));
        behind.clock.advance(TimeDelta::seconds(HOUR - 60));
        assert!(!behind.lease.acquire_if_free(&fs, "proj").unwrap());
        assert!(!ahead.lease.acquire_if_free(&fs, "proj").unwrap());
    }

    #[test]
    fn test_unknown_offset_tolerates_small_skew() {
        let (_tmp, fs) = dest();
        let ahead = Process::new(1_000_000, 5 * 60, false);
        let behind = Process::new(1_000_000, -5 * 60, false);

        assert!(behind.lease.acquire_if_free(&fs, "proj").unwrap());
        assert!(!ahead.lease.acquire_if_free(&fs, "proj").unwrap());
    }

    #[test]
    fn test_stale_lease_is_reclaimed() {
        let (_tmp, fs) = dest();
        let crashed = Process::new(1_000_000, 0, true);
        assert!(crashed.lease.acquire_if_free(&fs, "proj").unwrap());

        let sibling = Process::new(1_000_000 + HOUR + 1, 10 * 60, true);
        assert!(sibling.lease.acquire_if_free(&fs, "proj").unwrap());
        assert_eq!(
            fs.modified(&working_file_name("proj")).unwrap(),
            Some(at(1_000_000 + HOUR + 1))
        );
    }

    #[test]
    fn test_lease_expires_exactly_at_limit() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);
        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        p.clock.advance(TimeDelta::seconds(HOUR));
        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
    }

    #[test]
    fn test_release_without_markers_is_ok() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);
        p.lease.release(&fs, "proj", None).unwrap();
        assert!(!fs.exists(&working_file_name("proj")).unwrap());
        assert!(!fs.exists(&last_error_file_name("proj")).unwrap());
    }

    #[test]
    fn test_release_frees_lease() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);
        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        p.lease.release(&fs, "proj", None).unwrap();

        let other = Process::new(1_000_000, 60, true);
        assert!(other.lease.acquire_if_free(&fs, "proj").unwrap());
    }

    #[test]
    fn test_last_error_persisted_then_cleared() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);

        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        p.lease.release(&fs, "proj", Some("branch not found")).unwrap();
        let status = p.lease.status(&fs, "proj").unwrap();
        assert_eq!(status.last_error.as_deref(), Some("branch not found"));
        assert_eq!(status.working_since, None);
        assert!(!status.live);

        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        p.lease.release(&fs, "proj", None).unwrap();
        assert_eq!(p.lease.status(&fs, "proj").unwrap().last_error, None);
    }

    #[test]
    fn test_status_reports_live_lease() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);
        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());

        let status = p.lease.status(&fs, "proj").unwrap();
        assert_eq!(status.working_since, Some(at(1_000_000)));
        assert!(status.live);
    }

    #[test]
    fn test_remove_lock_tolerates_missing_file() {
        let (_tmp, fs) = dest();
        let p = Process::new(1_000_000, 0, true);
        p.lease.remove_lock(&fs, "proj").unwrap();

        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
        p.lease.release(&fs, "proj", None).unwrap();
        p.lease.remove_lock(&fs, "proj").unwrap();
        assert!(!fs.exists(&lock_file_name("proj")).unwrap());
    }

    #[test]
    fn test_orphan_lock_file_is_not_a_lease() {
        let (_tmp, fs) = dest();
        fs.create(&lock_file_name("proj")).unwrap();
        let p = Process::new(1_000_000, 0, true);
        assert!(p.lease.acquire_if_free(&fs, "proj").unwrap());
    }
}
