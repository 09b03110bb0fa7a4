//! The autogit manager
//!
//! Clones and pulls source repository branches into destination directories
//! of the shared store, and deletes those checkouts again. Requests for the
//! same destination repository are rolled up into one job while they are
//! queued, never run concurrently within this process, and are guarded
//! across processes by the leases in [`crate::lease`].
//!
//! Sync jobs are drained by a fixed pool of workers; deletes by a single
//! worker. Every submission returns a [`DoneSignal`] that fires when the job
//! has finished, successfully or not.

mod delete;
mod reset;
mod watch;

pub use watch::AutoPullRepo;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::TimeDelta;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::changes::{ChangeFeed, FsChangeFeed};
use crate::clock::{CommonClock, FixedOffset, NoOffset, OffsetSource, SystemClock};
use crate::config::{Config, ManagerConfig, DEFAULT_WORKERS};
use crate::git::{GitSyncer, Syncer};
use crate::lease::{LeaseCoordinator, LeaseStatus, CLONING_FILE_NAME, DEFAULT_WORK_TIME_LIMIT};
use crate::registry::RepoRegistry;
use crate::request::{DeleteRequest, Destination, SourceRepo, SyncRequest};
use crate::signal::DoneSignal;
use crate::store::{LocalStore, Store};
use crate::tracker::RequestTracker;
use crate::{Error, Result};

/// Tunables fixed for the lifetime of a manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Number of parallel sync workers
    pub workers: usize,
    /// How long a working marker keeps other processes away
    pub work_time_limit: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            work_time_limit: DEFAULT_WORK_TIME_LIMIT,
        }
    }
}

impl ManagerOptions {
    /// Set the number of sync workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the lease time limit
    pub fn with_work_time_limit(mut self, limit: Duration) -> Self {
        self.work_time_limit = limit;
        self
    }
}

impl From<&ManagerConfig> for ManagerOptions {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            workers: config.workers,
            work_time_limit: config.work_time_limit,
        }
    }
}

/// The external capabilities a manager works through
#[derive(Clone)]
pub struct Collaborators {
    /// The shared store
    pub store: Arc<dyn Store>,
    /// Performs the actual git reset
    pub syncer: Arc<dyn Syncer>,
    /// Skew-corrected clock for lease timestamps
    pub clock: CommonClock,
    /// Change notifications for watched repositories
    pub feed: Arc<dyn ChangeFeed>,
}

impl Collaborators {
    /// Collaborators for a store in a local directory tree
    pub fn local(config: &Config) -> Result<Self> {
        let root = config.store.root_or_default()?;
        let mut store = LocalStore::new(&root);
        if let Some(scratch) = &config.store.scratch_dir {
            store = store.with_scratch_dir(scratch);
        }

        let offset: Arc<dyn OffsetSource> = match config.clock.offset_secs {
            Some(secs) => Arc::new(FixedOffset(TimeDelta::seconds(secs))),
            None => Arc::new(NoOffset),
        };

        Ok(Self {
            store: Arc::new(store),
            syncer: Arc::new(GitSyncer::new()),
            clock: CommonClock::new(Arc::new(SystemClock), offset),
            feed: Arc::new(FsChangeFeed::new(root)),
        })
    }
}

/// Everything a worker needs to run jobs
///
/// Workers hold this rather than the manager itself, so dropping the last
/// manager handle closes the queues and lets the workers wind down.
struct JobContext {
    store: Arc<dyn Store>,
    syncer: Arc<dyn Syncer>,
    lease: LeaseCoordinator,
    tracker: RequestTracker,
}

struct Inner {
    jobs: Arc<JobContext>,
    registry: Arc<RepoRegistry>,
    reset_queue: Mutex<Option<UnboundedSender<SyncRequest>>>,
    delete_queue: Mutex<Option<UnboundedSender<DeleteRequest>>>,
    resets_stopped: DoneSignal,
    deletes_stopped: DoneSignal,
}

impl Inner {
    fn reset_queue(&self) -> MutexGuard<'_, Option<UnboundedSender<SyncRequest>>> {
        self.reset_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delete_queue(&self) -> MutexGuard<'_, Option<UnboundedSender<DeleteRequest>>> {
        self.delete_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_queues(&self) {
        let resets = self.reset_queue().take();
        let deletes = self.delete_queue().take();
        if resets.is_some() || deletes.is_some() {
            debug!("Closed autogit queues");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close_queues();
    }
}

/// What is currently known about one checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoStatus {
    /// Destination holding the checkout
    pub destination: String,
    /// Repository name
    pub repo: String,
    /// Whether the checkout directory exists
    pub exists: bool,
    /// Whether the first clone is still pending
    pub cloning: bool,
    /// Lease files next to the checkout
    #[serde(flatten)]
    pub lease: LeaseStatus,
}

/// Handle to a running manager; clones share the same workers
#[derive(Clone)]
pub struct AutogitManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AutogitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutogitManager")
            .field("pending_resets", &self.inner.jobs.tracker.pending().count())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl AutogitManager {
    /// Start the sync worker pool and the delete worker
    ///
    /// Must be called from within a tokio runtime; workers run on it.
    pub fn start(options: ManagerOptions, collaborators: Collaborators) -> Result<Self> {
        if options.workers == 0 {
            return Err(Error::Config(
                "Autogit manager needs at least one worker".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|e| {
            Error::Setup(format!(
                "Autogit manager must be started inside a tokio runtime: {}",
                e
            ))
        })?;

        let jobs = Arc::new(JobContext {
            store: collaborators.store,
            syncer: collaborators.syncer,
            lease: LeaseCoordinator::new(collaborators.clock, options.work_time_limit)?,
            tracker: RequestTracker::new(),
        });

        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();
        let resets_stopped = reset::spawn_pool(&runtime, jobs.clone(), reset_rx, options.workers);
        let deletes_stopped = delete::spawn_loop(&runtime, jobs.clone(), delete_rx);
        let registry = RepoRegistry::new(collaborators.feed, runtime);

        info!(
            workers = options.workers,
            work_time_limit = ?options.work_time_limit,
            "Started autogit manager"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                jobs,
                registry,
                reset_queue: Mutex::new(Some(reset_tx)),
                delete_queue: Mutex::new(Some(delete_tx)),
                resets_stopped,
                deletes_stopped,
            }),
        })
    }

    /// Queue a clone of `source` into `destination/<repo>`
    ///
    /// `destination` must already exist. If the checkout directory is empty a
    /// `CLONING` placeholder is written into it first, so users can see that
    /// a clone is on its way.
    ///
    /// Whatever is already in the checkout is trampled; callers must make
    /// sure it came from the same repository and branch. Non-default branches
    /// should get a destination of their own.
    ///
    /// Dropping the returned future only abandons the wait: once the
    /// placeholder has been written the clone is always queued.
    pub async fn clone_repo(&self, source: SourceRepo, destination: Destination) -> Result<DoneSignal> {
        debug!(source = %source, destination = %destination, "Autogit clone request");
        let manager = self.clone();
        let submit = tokio::spawn(async move {
            let store = manager.inner.jobs.store.clone();
            let (src, dst) = (source.clone(), destination.clone());
            run_blocking(move || reset::prepare_clone(store.as_ref(), &src, &dst)).await?;
            manager.queue_reset(SyncRequest::new(source, destination))
        });
        submit.await?
    }

    /// Queue a pull of `source` into the existing `destination/<repo>`
    pub async fn pull_repo(&self, source: SourceRepo, destination: Destination) -> Result<DoneSignal> {
        debug!(source = %source, destination = %destination, "Autogit pull request");
        let store = self.inner.jobs.store.clone();
        let (repo, dst) = (source.repo.clone(), destination.clone());
        run_blocking(move || reset::check_checkout_exists(store.as_ref(), &dst, &repo)).await?;
        self.queue_reset(SyncRequest::new(source, destination))
    }

    /// Queue removal of the checkout `destination/<repo>`
    ///
    /// Deletes are never coalesced; each one re-checks the checkout when it
    /// runs.
    pub fn delete_repo(&self, destination: Destination, repo: &str, branch: &str) -> Result<DoneSignal> {
        debug!(destination = %destination, repo, branch, "Autogit delete request");
        let request = DeleteRequest::new(destination, repo, branch)?;
        let signal = request.signal().clone();

        let queue = self.inner.delete_queue();
        let sender = queue.as_ref().ok_or(Error::ShuttingDown)?;
        sender.send(request).map_err(|_| Error::ShuttingDown)?;
        Ok(signal)
    }

    /// Register a sync request, or hand back the queued one it duplicates
    ///
    /// Registration and enqueueing happen under the queue lock with no
    /// suspension point in between: once another caller has been turned away
    /// in favor of this request, the request is guaranteed to reach a worker.
    fn queue_reset(&self, request: SyncRequest) -> Result<DoneSignal> {
        let id = request.id();
        let signal = request.signal().clone();
        let tracker = &self.inner.jobs.tracker;

        let queue = self.inner.reset_queue();
        let sender = queue.as_ref().ok_or(Error::ShuttingDown)?;
        if let Some(existing) = tracker.register(&id, &signal) {
            debug!(id = %id, "Request already queued; sharing its completion");
            return Ok(existing);
        }
        if sender.send(request).is_err() {
            tracker.unregister(&id);
            return Err(Error::ShuttingDown);
        }
        debug!(id = %id, "Queued new reset request");
        Ok(signal)
    }

    /// Report the lease files and placeholder state of a checkout
    pub async fn status(&self, destination: &Destination, repo: &str) -> Result<RepoStatus> {
        crate::request::validate_repo_name(repo)?;
        let jobs = self.inner.jobs.clone();
        let (dst, repo) = (destination.clone(), repo.to_string());
        run_blocking(move || {
            let fs = jobs.store.open_destination(&dst)?;
            let lease = jobs.lease.status(fs.as_ref(), &repo)?;
            Ok(RepoStatus {
                destination: dst.to_string(),
                exists: fs.exists(&repo)?,
                cloning: fs.exists(&format!("{}/{}", repo, CLONING_FILE_NAME))?,
                repo,
                lease,
            })
        })
        .await
    }

    /// Keep `destination/<repo>` pulled whenever `source` changes
    pub fn watch(&self, source: SourceRepo, destination: Destination) -> Result<Arc<AutoPullRepo>> {
        let node = self
            .inner
            .jobs
            .store
            .source_node(&source.namespace, &source.repo)?;
        let scope = source.namespace.clone();
        let repo = Arc::new(AutoPullRepo::new(
            node.clone(),
            source,
            destination,
            Arc::downgrade(&self.inner),
        ));
        self.inner.registry.watch(node, &scope, repo.clone())?;
        Ok(repo)
    }

    /// The watched-repository registry
    pub fn registry(&self) -> &RepoRegistry {
        &self.inner.registry
    }

    /// Number of sync requests registered but not yet finished
    pub fn pending_resets(&self) -> usize {
        self.inner.jobs.tracker.pending().count()
    }

    /// Wait until every registered sync request has finished
    pub async fn wait_for_resets(&self) {
        self.inner.jobs.tracker.pending().wait_idle().await;
    }

    /// Wait until every in-flight update hook has finished
    pub async fn wait_for_updates(&self) {
        self.inner.registry.wait_for_updates().await;
    }

    /// Stop accepting requests and wait for both worker loops to exit
    ///
    /// Requests already in a queue still run before the loops exit.
    /// Submissions after this point fail with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        info!("Shutting down autogit manager");
        self.inner.close_queues();
        self.inner.resets_stopped.wait().await;
        self.inner.deletes_stopped.wait().await;
        debug!("Autogit workers stopped");
    }
}

/// Run blocking store or git work off the async workers
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Combine a job's result with the result of cleaning up after it
///
/// A cleanup failure only replaces a successful result.
fn finish(result: Result<()>, cleanup: Result<()>) -> Result<()> {
    match (result, cleanup) {
        (Ok(()), cleanup) => cleanup,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup_err)) => {
            warn!(error = %cleanup_err, "Cleanup also failed");
            Err(e)
        }
    }
}
