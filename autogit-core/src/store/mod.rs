//! Shared file store access
//!
//! The coordination protocol only needs a handful of primitives from the
//! store: named files with explicit modification times, an exclusive advisory
//! lock on an open file, recursive removal and a durable flush. They are
//! described by [`DestinationFs`]; [`Store`] resolves requests to them.

mod local;

pub use local::{LocalDir, LocalStore};

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::warn;

use crate::changes::NodeId;
use crate::request::{Destination, Namespace};
use crate::Result;

/// An exclusively locked file; dropping it releases the lock
pub trait LockedFile: Send {
    /// Release the lock early, flushing pending changes first
    fn unlock(&mut self) -> io::Result<()>;

    /// Flush, unlock and close the file
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// A destination directory opened in the shared store
///
/// All names are relative to the directory and may contain `/`.
pub trait DestinationFs: Send + Sync {
    /// Local path of a named entry, for collaborators that need real paths
    fn path(&self, name: &str) -> PathBuf;

    /// Create (or open) a file and take an exclusive lock on it, blocking
    /// until the lock is available
    fn lock(&self, name: &str) -> io::Result<Box<dyn LockedFile>>;

    /// Create an empty file, truncating an existing one
    fn create(&self, name: &str) -> io::Result<()>;

    /// Replace a file's contents
    fn write_file(&self, name: &str, contents: &str) -> io::Result<()>;

    /// Read a file's contents
    fn read_to_string(&self, name: &str) -> io::Result<String>;

    /// Modification time, or `None` when the entry does not exist
    fn modified(&self, name: &str) -> io::Result<Option<DateTime<Utc>>>;

    /// Set a file's modification time explicitly
    fn set_modified(&self, name: &str, at: DateTime<Utc>) -> io::Result<()>;

    /// Whether an entry exists
    fn exists(&self, name: &str) -> io::Result<bool>;

    /// Remove a file; a missing file is reported as `NotFound`
    fn remove(&self, name: &str) -> io::Result<()>;

    /// Create a directory and its parents
    fn mkdir_all(&self, name: &str) -> io::Result<()>;

    /// Names of the entries in a directory
    fn read_dir(&self, name: &str) -> io::Result<Vec<String>>;

    /// Remove a directory tree
    fn remove_all(&self, name: &str) -> io::Result<()>;

    /// Durably commit everything written under this directory
    fn sync_all(&self) -> io::Result<()>;
}

/// Remove a file, treating a missing file as already removed
pub fn remove_if_exists(fs: &dyn DestinationFs, name: &str) -> io::Result<()> {
    match fs.remove(name) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// The shared store as seen by the manager
pub trait Store: Send + Sync {
    /// Open an existing destination directory
    fn open_destination(&self, destination: &Destination) -> Result<Box<dyn DestinationFs>>;

    /// Local location of a source repository
    fn source_repo(&self, namespace: &Namespace, repo: &str) -> Result<PathBuf>;

    /// Change-feed identity of a source repository
    fn source_node(&self, namespace: &Namespace, repo: &str) -> Result<NodeId>;

    /// Build a disposable, isolated workspace for a single job
    fn new_job_workspace(&self) -> Result<JobWorkspace>;
}

/// Scratch space owned by one job and removed when the job ends
#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    /// Wrap a temporary directory
    pub fn new(dir: TempDir) -> Self {
        Self { dir }
    }

    /// Root of the workspace
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the workspace; failures are logged, not propagated
    pub fn teardown(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Error cleaning job workspace");
        }
    }
}
