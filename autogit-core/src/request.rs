//! Sync and delete request types
//!
//! A sync request's identity is the destination namespace's canonical path,
//! the destination directory and the repository name. The branch is not part
//! of the identity: two requests that differ only by branch land in the same
//! physical directory, so callers must keep branch-specific destinations
//! distinct themselves.

use std::fmt;

use serde::Serialize;

use crate::signal::{done_pair, DoneSignal, DoneTrigger};
use crate::{Error, Result};

/// Prefix for namespace canonical paths
const CANONICAL_ROOT: &str = "/autogit";

/// A top-level folder in the shared store (a user's or team's space)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Namespace {
    name: String,
}

impl Namespace {
    /// Validate and wrap a namespace name
    pub fn parse(name: &str) -> Result<Self> {
        validate_segment("namespace", name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// The bare namespace name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical, store-wide path of this namespace
    pub fn canonical_path(&self) -> String {
        format!("{}/{}", CANONICAL_ROOT, self.name)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_path())
    }
}

/// A branch of a source repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceRepo {
    /// Namespace holding the repository
    pub namespace: Namespace,
    /// Repository name
    pub repo: String,
    /// Branch name (without the `refs/heads/` prefix)
    pub branch: String,
}

impl SourceRepo {
    /// Build a source from its parts
    pub fn new(namespace: Namespace, repo: &str, branch: &str) -> Result<Self> {
        validate_repo_name(repo)?;
        if branch.trim().is_empty() {
            return Err(Error::Setup("Branch name must not be empty".to_string()));
        }
        Ok(Self {
            namespace,
            repo: repo.to_string(),
            branch: branch.to_string(),
        })
    }

    /// Parse `namespace/repo`
    pub fn parse(input: &str, branch: &str) -> Result<Self> {
        let (namespace, repo) = input.trim().split_once('/').ok_or_else(|| {
            Error::Setup(format!(
                "Invalid source repository: {}. Expected format: namespace/repo",
                input
            ))
        })?;
        Self::new(Namespace::parse(namespace)?, repo, branch)
    }
}

impl fmt::Display for SourceRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.repo, self.branch)
    }
}

/// A directory inside a namespace that repositories are checked out into
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Destination {
    /// Namespace holding the destination
    pub namespace: Namespace,
    /// Directory relative to the namespace root; empty for the root itself
    pub dir: String,
}

impl Destination {
    /// Build a destination from its parts
    pub fn new(namespace: Namespace, dir: &str) -> Result<Self> {
        let dir = dir.trim_matches('/');
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            validate_segment("destination directory", segment)?;
        }
        Ok(Self {
            namespace,
            dir: dir.to_string(),
        })
    }

    /// Parse `namespace[/dir...]`
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim().trim_matches('/');
        let (namespace, dir) = input.split_once('/').unwrap_or((input, ""));
        Self::new(Namespace::parse(namespace)?, dir)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dir.is_empty() {
            write!(f, "{}", self.namespace)
        } else {
            write!(f, "{}/{}", self.namespace, self.dir)
        }
    }
}

/// Identity of a sync job slot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Identity of syncing `repo` into `destination`
    pub fn new(destination: &Destination, repo: &str) -> Self {
        let canonical = destination.namespace.canonical_path();
        let joined = [canonical.as_str(), destination.dir.as_str(), repo]
            .iter()
            .flat_map(|part| part.split('/'))
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self(format!("/{}", joined))
    }

    /// The identity as a path-like string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a sync worker needs to run a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    /// Where the content comes from
    pub source: SourceRepo,
    /// Where it is checked out (into `destination/source.repo`)
    pub destination: Destination,
}

impl SyncJob {
    /// Identity used for coalescing and in-process serialization
    pub fn id(&self) -> RequestId {
        RequestId::new(&self.destination, &self.source.repo)
    }
}

/// A queued clone/pull request
#[derive(Debug)]
pub(crate) struct SyncRequest {
    pub(crate) job: SyncJob,
    signal: DoneSignal,
    trigger: DoneTrigger,
}

impl SyncRequest {
    pub(crate) fn new(source: SourceRepo, destination: Destination) -> Self {
        let (trigger, signal) = done_pair();
        Self {
            job: SyncJob {
                source,
                destination,
            },
            signal,
            trigger,
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.job.id()
    }

    pub(crate) fn signal(&self) -> &DoneSignal {
        &self.signal
    }

    /// Retire the request, releasing everyone waiting on it
    pub(crate) fn complete(self) {
        self.trigger.fire();
    }
}

/// What the delete worker needs to run a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteJob {
    /// Directory holding the checkout
    pub destination: Destination,
    /// Checkout to remove (`destination/repo`)
    pub repo: String,
    /// Branch the checkout tracked; informational only
    pub branch: String,
}

/// A queued delete request
#[derive(Debug)]
pub(crate) struct DeleteRequest {
    pub(crate) job: DeleteJob,
    signal: DoneSignal,
    trigger: DoneTrigger,
}

impl DeleteRequest {
    pub(crate) fn new(destination: Destination, repo: &str, branch: &str) -> Result<Self> {
        validate_repo_name(repo)?;
        let (trigger, signal) = done_pair();
        Ok(Self {
            job: DeleteJob {
                destination,
                repo: repo.to_string(),
                branch: branch.to_string(),
            },
            signal,
            trigger,
        })
    }

    pub(crate) fn signal(&self) -> &DoneSignal {
        &self.signal
    }

    pub(crate) fn complete(self) {
        self.trigger.fire();
    }
}

/// Check that a repository name is a single, plain path segment
pub fn validate_repo_name(repo: &str) -> Result<()> {
    validate_segment("repository name", repo)
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(Error::Setup(format!("Invalid {}: {:?}", what, value)));
    }
    Ok(())
}
