//! Reset a destination directory to a source branch using libgit2
//!
//! Objects are fetched into a throwaway bare repository inside the job
//! workspace; the destination receives only the checked-out tree, no `.git`.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use git2::{ObjectType, Repository, Tree, TreeWalkMode, TreeWalkResult};
use tracing::{debug, info};
use url::Url;

use super::Syncer;
use crate::store::JobWorkspace;
use crate::{Error, Result};

/// Git file mode of an executable blob
const EXECUTABLE_MODE: i32 = 0o100755;

/// Git file mode of a symbolic link
const LINK_MODE: i32 = 0o120000;

/// Full reference name of a branch
pub fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

/// A [`Syncer`] backed by libgit2
#[derive(Debug, Default, Clone, Copy)]
pub struct GitSyncer;

impl GitSyncer {
    /// Create a new syncer
    pub fn new() -> Self {
        Self
    }
}

impl Syncer for GitSyncer {
    fn reset(
        &self,
        workspace: &JobWorkspace,
        source: &Path,
        destination: &Path,
        branch: &str,
    ) -> Result<()> {
        let reference = branch_ref(branch);
        let url = source_url(source)?;
        debug!(source = %url, destination = %destination.display(), reference, "Starting the reset");

        let objects = Repository::init_bare(workspace.path().join("objects"))?;
        fetch_ref(&objects, &url, &reference)?;

        let commit = match objects.find_reference(&reference) {
            Ok(r) => r.peel_to_commit()?,
            Err(e) if e.code() == git2::ErrorCode::NotFound => {
                return Err(Error::Other(format!(
                    "Branch '{}' not found in {}",
                    branch,
                    source.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let tree = commit.tree()?;

        let written = materialize(&objects, &tree, destination)?;
        prune(destination, Path::new(""), &written)?;

        info!(
            commit = %commit.id(),
            destination = %destination.display(),
            entries = written.len(),
            "Reset destination to branch"
        );
        Ok(())
    }
}

fn source_url(source: &Path) -> Result<Url> {
    let canonical = source.canonicalize().map_err(|e| {
        Error::Setup(format!(
            "Source repository not found: {}: {}",
            source.display(),
            e
        ))
    })?;
    Url::from_file_path(&canonical).map_err(|()| {
        Error::Setup(format!(
            "Source repository path is not absolute: {}",
            canonical.display()
        ))
    })
}

fn fetch_ref(repo: &Repository, url: &Url, reference: &str) -> Result<()> {
    let mut remote = repo.remote_anonymous(url.as_str())?;
    let refspec = format!("+{0}:{0}", reference);
    remote.fetch(&[refspec.as_str()], None, None)?;
    Ok(())
}

/// Write every entry of `tree` under `destination`, returning the relative
/// paths that belong to the tree
fn materialize(repo: &Repository, tree: &Tree<'_>, destination: &Path) -> Result<HashSet<PathBuf>> {
    fs::create_dir_all(destination)?;

    let mut entries = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if let Some(name) = entry.name() {
            entries.push((Path::new(dir).join(name), entry.id(), entry.kind(), entry.filemode()));
        }
        TreeWalkResult::Ok
    })?;

    let mut wanted = HashSet::new();
    for (path, id, kind, mode) in entries {
        let target = destination.join(&path);
        match kind {
            Some(ObjectType::Tree) => {
                clear_conflicting(&target, true)?;
                fs::create_dir_all(&target)?;
            }
            Some(ObjectType::Blob) => {
                clear_conflicting(&target, false)?;
                let blob = repo.find_blob(id)?;
                if mode == LINK_MODE {
                    write_link(&target, blob.content())?;
                } else {
                    fs::write(&target, blob.content())?;
                    set_executable(&target, mode == EXECUTABLE_MODE)?;
                }
            }
            _ => {
                debug!(path = %path.display(), "Skipping non-file tree entry");
                continue;
            }
        }
        wanted.insert(path);
    }
    Ok(wanted)
}

/// Remove whatever sits at `target` if it cannot be overwritten in place
fn clear_conflicting(target: &Path, want_dir: bool) -> io::Result<()> {
    let meta = match fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() && !want_dir {
        fs::remove_dir_all(target)
    } else if !meta.is_dir() && (want_dir || meta.file_type().is_symlink()) {
        fs::remove_file(target)
    } else {
        Ok(())
    }
}

/// Remove everything under `root/relative` that is not in `wanted`
fn prune(root: &Path, relative: &Path, wanted: &HashSet<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let path = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        if wanted.contains(&path) {
            if file_type.is_dir() {
                prune(root, &path, wanted)?;
            }
            continue;
        }
        debug!(path = %path.display(), "Removing stale entry");
        if file_type.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_link(target: &Path, content: &[u8]) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(content), target)
}

#[cfg(not(unix))]
fn write_link(target: &Path, content: &[u8]) -> io::Result<()> {
    fs::write(target, content)
}

#[cfg(unix)]
fn set_executable(target: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_target: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::SourceFixture;
    use super::*;
    use tempfile::TempDir;

    fn workspace(tmp: &TempDir) -> JobWorkspace {
        let dir = tempfile::Builder::new().tempdir_in(tmp.path()).unwrap();
        JobWorkspace::new(dir)
    }

    #[test]
    fn test_branch_ref() {
        assert_eq!(branch_ref("master"), "refs/heads/master");
        assert_eq!(branch_ref("feature/x"), "refs/heads/feature/x");
    }

    #[test]
    fn test_reset_materializes_branch() {
        let tmp = TempDir::new().unwrap();
        let source = SourceFixture::init(&tmp.path().join("src"));
        source.commit(
            "master",
            &[("README.md", Some("hello\n")), ("src/lib.rs", Some("// lib\n"))],
        );

        let dest = tmp.path().join("dst/proj");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("CLONING"), "teamA/proj:master").unwrap();

        let ws = workspace(&tmp);
        GitSyncer::new()
            .reset(&ws, &source.path(), &dest, "master")
            .unwrap();

        assert_eq!(fs::read_to_string(dest.join("README.md")).unwrap(), "hello\n");
        assert_eq!(fs::read_to_string(dest.join("src/lib.rs")).unwrap(), "// lib\n");
        assert!(!dest.join("CLONING").exists());
        assert!(!dest.join(".git").exists());
    }

    #[test]
    fn test_reset_removes_deleted_files() {
        let tmp = TempDir::new().unwrap();
        let source = SourceFixture::init(&tmp.path().join("src"));
        source.commit("master", &[("a.txt", Some("a")), ("dir/b.txt", Some("b"))]);

        let dest = tmp.path().join("dst/proj");
        GitSyncer::new()
            .reset(&workspace(&tmp), &source.path(), &dest, "master")
            .unwrap();
        assert!(dest.join("dir/b.txt").exists());

        source.commit("master", &[("dir/b.txt", None), ("a.txt", Some("a2"))]);
        GitSyncer::new()
            .reset(&workspace(&tmp), &source.path(), &dest, "master")
            .unwrap();

        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "a2");
        assert!(!dest.join("dir").exists());
    }

    #[test]
    fn test_reset_tracks_requested_branch() {
        let tmp = TempDir::new().unwrap();
        let source = SourceFixture::init(&tmp.path().join("src"));
        source.commit("master", &[("which.txt", Some("master"))]);
        source.commit("dev", &[("which.txt", Some("dev"))]);

        let dest = tmp.path().join("dst/proj");
        GitSyncer::new()
            .reset(&workspace(&tmp), &source.path(), &dest, "dev")
            .unwrap();
        assert_eq!(fs::read_to_string(dest.join("which.txt")).unwrap(), "dev");
    }

    #[test]
    fn test_reset_missing_branch_fails() {
        let tmp = TempDir::new().unwrap();
        let source = SourceFixture::init(&tmp.path().join("src"));
        source.commit("master", &[("a.txt", Some("a"))]);

        let dest = tmp.path().join("dst/proj");
        let result = GitSyncer::new().reset(&workspace(&tmp), &source.path(), &dest, "nope");
        assert!(result.is_err());
    }

    #[test]
    fn test_reset_missing_source_is_setup_error() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("dst/proj");
        let err = GitSyncer::new()
            .reset(&workspace(&tmp), &tmp.path().join("missing"), &dest, "master")
            .unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
    }
}
