//! Clone and pull commands

use clap::Args;

use autogit_core::{Config, Destination, RepoStatus, SourceRepo};

use super::{start_manager, status::print_status};

/// Which kind of sync to request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// First checkout; creates the checkout directory
    Clone,
    /// Update an existing checkout
    Pull,
}

/// Sync a source branch into a destination directory
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Source repository (namespace/repo)
    source: String,

    /// Destination directory (namespace[/dir])
    destination: String,

    /// Branch to check out
    #[arg(short, long, default_value = "master")]
    branch: String,
}

impl SyncArgs {
    /// Execute the sync command
    pub async fn execute(&self, kind: SyncKind, verbose: bool, config: &Config) -> anyhow::Result<()> {
        let source = SourceRepo::parse(&self.source, &self.branch)?;
        let destination = Destination::parse(&self.destination)?;

        let manager = start_manager(config)?;
        let done = match kind {
            SyncKind::Clone => manager.clone_repo(source.clone(), destination.clone()).await?,
            SyncKind::Pull => manager.pull_repo(source.clone(), destination.clone()).await?,
        };

        if verbose {
            println!("Queued {:?} of {} into {}", kind, source, destination);
        }
        done.wait().await;

        let status = manager.status(&destination, &source.repo).await?;
        manager.shutdown().await;

        print_status(&status);
        match SyncOutcome::from_status(&status) {
            SyncOutcome::Synced => Ok(()),
            SyncOutcome::Skipped => {
                println!("Sync of {} skipped; another worker is in charge", source);
                Ok(())
            }
            SyncOutcome::Failed(err) => anyhow::bail!("Sync of {} failed: {}", source, err),
        }
    }
}

/// What a finished sync left behind
#[derive(Debug, PartialEq, Eq)]
enum SyncOutcome {
    Synced,
    /// A live lease held by someone else; any last error is theirs
    Skipped,
    Failed(String),
}

impl SyncOutcome {
    fn from_status(status: &RepoStatus) -> Self {
        if status.lease.live {
            return Self::Skipped;
        }
        match &status.lease.last_error {
            Some(err) => Self::Failed(err.clone()),
            None => Self::Synced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autogit_core::LeaseStatus;
    use chrono::Utc;

    fn status(live: bool, last_error: Option<&str>) -> RepoStatus {
        RepoStatus {
            destination: "teamB/mirror".to_string(),
            repo: "proj".to_string(),
            exists: true,
            cloning: false,
            lease: LeaseStatus {
                working_since: live.then(Utc::now),
                live,
                last_error: last_error.map(str::to_string),
            },
        }
    }

    #[test]
    fn test_outcome_synced() {
        assert_eq!(SyncOutcome::from_status(&status(false, None)), SyncOutcome::Synced);
    }

    #[test]
    fn test_outcome_failed() {
        assert_eq!(
            SyncOutcome::from_status(&status(false, Some("fetch failed"))),
            SyncOutcome::Failed("fetch failed".to_string())
        );
    }

    #[test]
    fn test_foreign_error_under_live_lease_is_a_skip() {
        assert_eq!(
            SyncOutcome::from_status(&status(true, Some("earlier failure"))),
            SyncOutcome::Skipped
        );
    }
}
