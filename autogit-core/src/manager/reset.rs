//! Sync (clone/pull) worker pool

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{finish, run_blocking, JobContext};
use crate::lease::{close_lock, lock_file_name, CLONING_FILE_NAME};
use crate::request::{Destination, SourceRepo, SyncJob, SyncRequest};
use crate::signal::{done_pair, DoneSignal};
use crate::store::{DestinationFs, JobWorkspace, LockedFile, Store};
use crate::tracker::Claim;
use crate::{Error, Result};

type SharedQueue = Arc<AsyncMutex<UnboundedReceiver<SyncRequest>>>;

/// Launch `workers` loops draining one shared queue
///
/// The returned signal fires once every loop has exited, which happens after
/// the queue is closed and drained.
pub(super) fn spawn_pool(
    runtime: &Handle,
    jobs: Arc<JobContext>,
    queue: UnboundedReceiver<SyncRequest>,
    workers: usize,
) -> DoneSignal {
    let (stopped, signal) = done_pair();
    let queue: SharedQueue = Arc::new(AsyncMutex::new(queue));

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        pool.spawn_on(reset_loop(worker, jobs.clone(), queue.clone()), runtime);
    }

    runtime.spawn(async move {
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Reset worker exited abnormally");
            }
        }
        debug!("All reset workers exited");
        stopped.fire();
    });
    signal
}

async fn reset_loop(worker: usize, jobs: Arc<JobContext>, queue: SharedQueue) {
    debug!(worker, "Reset worker started");
    loop {
        // Only hold the receiver while waiting for the next item.
        let next = queue.lock().await.recv().await;
        let Some(request) = next else {
            break;
        };
        let span = info_span!(
            "autogit_op",
            op_id = %crate::new_op_id(),
            worker,
            id = %request.id()
        );
        process(&jobs, request).instrument(span).await;
    }
    debug!(worker, "Reset worker exited");
}

async fn process(jobs: &Arc<JobContext>, request: SyncRequest) {
    let id = request.id();

    // The lock file is taken per open handle, not per worker, so two workers
    // in this process must never work on the same identity at once.
    loop {
        match jobs.tracker.try_claim(&id, request.signal()) {
            Claim::Acquired => break,
            Claim::Busy(running) => {
                debug!(
                    source = %request.job.source,
                    destination = %request.job.destination,
                    "Waiting for in-progress reset of the same checkout"
                );
                running.wait().await;
                debug!("Done waiting");
            }
        }
    }

    let job = request.job.clone();
    let ctx = jobs.clone();
    match run_blocking(move || ctx.do_reset(&job)).await {
        Ok(()) => debug!("Reset request completed"),
        Err(e) => warn!(error = %e, "Reset request failed"),
    }

    jobs.tracker.retire(&id);
    request.complete();
}

impl JobContext {
    /// Run one sync job: workspace, lease, reset, release
    fn do_reset(&self, job: &SyncJob) -> Result<()> {
        debug!(
            source = %job.source,
            destination = %job.destination,
            "Processing reset request"
        );
        let workspace = self.store.new_job_workspace()?;
        let result = self.reset_under_lease(&workspace, job);
        workspace.teardown();
        result
    }

    fn reset_under_lease(&self, workspace: &JobWorkspace, job: &SyncJob) -> Result<()> {
        let source = self.store.source_repo(&job.source.namespace, &job.source.repo)?;
        let fs = self.store.open_destination(&job.destination)?;
        let repo = job.source.repo.as_str();

        if !self.lease.acquire_if_free(fs.as_ref(), repo)? {
            info!(repo, "Another worker is currently in charge; skipping reset");
            return Ok(());
        }

        debug!("Starting the reset");
        let result = self
            .syncer
            .reset(workspace, &source, &fs.path(repo), &job.source.branch);
        let failure = result.as_ref().err().map(ToString::to_string);
        let released = self.lease.release(fs.as_ref(), repo, failure.as_deref());
        if result.is_ok() {
            info!(repo, destination = %job.destination, "Reset destination to source branch");
        }
        finish(result, released)
    }
}

/// Make sure the checkout directory exists and mark it while it is empty
///
/// Runs under the repository's lock file so it cannot interleave with a
/// worker's lease check on the same checkout.
pub(super) fn prepare_clone(store: &dyn Store, source: &SourceRepo, destination: &Destination) -> Result<()> {
    let fs = store.open_destination(destination)?;
    let mut lock = fs.lock(&lock_file_name(&source.repo))?;
    let result = write_placeholder(fs.as_ref(), lock.as_mut(), source);
    close_lock(lock, result)
}

fn write_placeholder(fs: &dyn DestinationFs, lock: &mut dyn LockedFile, source: &SourceRepo) -> Result<()> {
    fs.mkdir_all(&source.repo)?;
    if !fs.read_dir(&source.repo)?.is_empty() {
        return Ok(());
    }

    debug!(repo = %source.repo, "Making CLONING file");
    fs.write_file(
        &format!("{}/{}", source.repo, CLONING_FILE_NAME),
        &source.to_string(),
    )?;
    // Flush the placeholder before the reset is queued.
    lock.unlock()?;
    Ok(())
}

/// A pull needs the checkout to exist already
pub(super) fn check_checkout_exists(store: &dyn Store, destination: &Destination, repo: &str) -> Result<()> {
    let fs = store.open_destination(destination)?;
    if !fs.exists(repo)? {
        return Err(Error::Setup(format!(
            "Nothing to pull into: {}/{} does not exist",
            destination, repo
        )));
    }
    Ok(())
}
