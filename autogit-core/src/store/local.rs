//! Shared store backed by a local (or locally mounted) directory tree
//!
//! Layout under the store root:
//! - `<namespace>/<dir>`: destination directories
//! - `<namespace>/.autogit/repos/<repo>`: source git repositories

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use fs2::FileExt;

use super::{DestinationFs, JobWorkspace, LockedFile, Store};
use crate::changes::NodeId;
use crate::request::{validate_repo_name, Destination, Namespace};
use crate::{Error, Result};

/// Directory, relative to a namespace, that holds its source repositories
pub const SOURCE_REPOS_DIR: &str = ".autogit/repos";

/// A [`Store`] over a directory tree
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    scratch_dir: Option<PathBuf>,
}

impl LocalStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scratch_dir: None,
        }
    }

    /// Put job workspaces under `dir` instead of the system temp directory
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// The store root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root directory of a namespace
    pub fn namespace_dir(&self, namespace: &Namespace) -> PathBuf {
        self.root.join(namespace.name())
    }

    /// Local path of a destination directory
    pub fn destination_dir(&self, destination: &Destination) -> PathBuf {
        let base = self.namespace_dir(&destination.namespace);
        if destination.dir.is_empty() {
            base
        } else {
            base.join(&destination.dir)
        }
    }

    /// Local path of a source repository, whether or not it exists
    pub fn source_repo_dir(&self, namespace: &Namespace, repo: &str) -> PathBuf {
        self.namespace_dir(namespace).join(SOURCE_REPOS_DIR).join(repo)
    }

    /// Names of the source repositories in a namespace
    pub fn list_source_repos(&self, namespace: &Namespace) -> Result<Vec<String>> {
        let dir = self.namespace_dir(namespace).join(SOURCE_REPOS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut repos = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    repos.push(name.to_string());
                }
            }
        }
        repos.sort();
        Ok(repos)
    }
}

impl Store for LocalStore {
    fn open_destination(&self, destination: &Destination) -> Result<Box<dyn DestinationFs>> {
        let path = self.destination_dir(destination);
        if !path.is_dir() {
            return Err(Error::Setup(format!(
                "Destination directory does not exist: {} ({})",
                destination,
                path.display()
            )));
        }
        Ok(Box::new(LocalDir::new(path)))
    }

    fn source_repo(&self, namespace: &Namespace, repo: &str) -> Result<PathBuf> {
        validate_repo_name(repo)?;
        let path = self.source_repo_dir(namespace, repo);
        if !path.is_dir() {
            return Err(Error::Setup(format!(
                "Source repository does not exist: {}/{} ({})",
                namespace,
                repo,
                path.display()
            )));
        }
        Ok(path)
    }

    fn source_node(&self, namespace: &Namespace, repo: &str) -> Result<NodeId> {
        let path = self.source_repo(namespace, repo)?;
        Ok(NodeId::new(path.canonicalize()?))
    }

    fn new_job_workspace(&self) -> Result<JobWorkspace> {
        let base = self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);
        fs::create_dir_all(&base)?;
        let dir = tempfile::Builder::new()
            .prefix("autogit-job-")
            .tempdir_in(&base)?;
        Ok(JobWorkspace::new(dir))
    }
}

/// A destination directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalDir {
    root: PathBuf,
}

impl LocalDir {
    /// Wrap an existing directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DestinationFs for LocalDir {
    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn lock(&self, name: &str) -> io::Result<Box<dyn LockedFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path(name))?;
        FileExt::lock_exclusive(&file)?;
        Ok(Box::new(LocalLock {
            file,
            dir: self.root.clone(),
            locked: true,
        }))
    }

    fn create(&self, name: &str) -> io::Result<()> {
        File::create(self.path(name))?;
        Ok(())
    }

    fn write_file(&self, name: &str, contents: &str) -> io::Result<()> {
        fs::write(self.path(name), contents)
    }

    fn read_to_string(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.path(name))
    }

    fn modified(&self, name: &str) -> io::Result<Option<DateTime<Utc>>> {
        match fs::metadata(self.path(name)) {
            Ok(meta) => Ok(Some(meta.modified()?.into())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set_modified(&self, name: &str, at: DateTime<Utc>) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(self.path(name))?;
        file.set_modified(SystemTime::from(at))
    }

    fn exists(&self, name: &str) -> io::Result<bool> {
        self.path(name).try_exists()
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path(name))
    }

    fn mkdir_all(&self, name: &str) -> io::Result<()> {
        fs::create_dir_all(self.path(name))
    }

    fn read_dir(&self, name: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.path(name))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn remove_all(&self, name: &str) -> io::Result<()> {
        let path = self.path(name);
        if fs::symlink_metadata(&path)?.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn sync_all(&self) -> io::Result<()> {
        sync_dir(&self.root)
    }
}

struct LocalLock {
    file: File,
    dir: PathBuf,
    locked: bool,
}

impl LockedFile for LocalLock {
    fn unlock(&mut self) -> io::Result<()> {
        if !self.locked {
            return Ok(());
        }
        // Flush before letting anyone else in.
        sync_dir(&self.dir)?;
        self.file.sync_all()?;
        FileExt::unlock(&self.file)?;
        self.locked = false;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> io::Result<()> {
        self.unlock()
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
