//! Delete worker
//!
//! One loop, no coalescing: duplicate deletes simply run one after another
//! and each re-checks the checkout.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{finish, run_blocking, JobContext};
use crate::request::{DeleteJob, DeleteRequest};
use crate::signal::{done_pair, DoneSignal};
use crate::store::DestinationFs;
use crate::{Error, Result};

/// Launch the delete loop; the returned signal fires when it exits
pub(super) fn spawn_loop(
    runtime: &Handle,
    jobs: Arc<JobContext>,
    mut queue: UnboundedReceiver<DeleteRequest>,
) -> DoneSignal {
    let (stopped, signal) = done_pair();
    runtime.spawn(async move {
        while let Some(request) = queue.recv().await {
            let span = info_span!(
                "autogit_op",
                op_id = %crate::new_op_id(),
                destination = %request.job.destination,
                repo = %request.job.repo
            );
            let job = request.job.clone();
            let ctx = jobs.clone();
            async move {
                match run_blocking(move || ctx.do_delete(&job)).await {
                    Ok(()) => debug!("Delete request completed"),
                    Err(e) => warn!(error = %e, "Delete request failed"),
                }
            }
            .instrument(span)
            .await;
            request.complete();
        }
        debug!("Delete worker exited");
        stopped.fire();
    });
    signal
}

impl JobContext {
    fn do_delete(&self, job: &DeleteJob) -> Result<()> {
        debug!(branch = %job.branch, "Processing delete request");
        let workspace = self.store.new_job_workspace()?;
        let result = self.delete_under_lease(job);
        workspace.teardown();
        result
    }

    fn delete_under_lease(&self, job: &DeleteJob) -> Result<()> {
        let fs = self.store.open_destination(&job.destination)?;
        let repo = job.repo.as_str();

        if !self.lease.acquire_if_free(fs.as_ref(), repo)? {
            info!(repo, "Another worker is currently in charge; skipping delete");
            return Ok(());
        }

        let result = remove_checkout(fs.as_ref(), repo);
        let failure = result.as_ref().err().map(ToString::to_string);
        let result = finish(result, self.lease.release(fs.as_ref(), repo, failure.as_deref()));
        // Not atomic with the removal above; a crash in between leaves an
        // orphan lock file, which is not a lease.
        let result = finish(result, self.lease.remove_lock(fs.as_ref(), repo));
        if result.is_ok() {
            info!(repo, destination = %job.destination, "Deleted checkout");
        }
        result
    }
}

fn remove_checkout(fs: &dyn DestinationFs, repo: &str) -> Result<()> {
    if !fs.exists(repo)? {
        return Err(Error::Other(format!(
            "Checkout does not exist: {}",
            fs.path(repo).display()
        )));
    }
    fs.remove_all(repo)?;
    Ok(())
}
