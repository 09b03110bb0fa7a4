//! Repositories kept up to date from change notifications

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{AutogitManager, Inner};
use crate::changes::NodeId;
use crate::registry::WatchedRepo;
use crate::request::{Destination, SourceRepo};
use crate::{Error, Result};

/// A checkout that follows its source repository
///
/// Holds its manager weakly: once the manager is gone, notifications for
/// this repository are ignored.
pub struct AutoPullRepo {
    id: NodeId,
    source: SourceRepo,
    destination: Destination,
    manager: Weak<Inner>,
}

impl std::fmt::Debug for AutoPullRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoPullRepo")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

impl AutoPullRepo {
    pub(super) fn new(id: NodeId, source: SourceRepo, destination: Destination, manager: Weak<Inner>) -> Self {
        Self {
            id,
            source,
            destination,
            manager,
        }
    }

    /// Source branch this checkout follows
    pub fn source(&self) -> &SourceRepo {
        &self.source
    }

    /// Directory the checkout lives in
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    fn manager(&self) -> Result<AutogitManager> {
        self.manager
            .upgrade()
            .map(|inner| AutogitManager { inner })
            .ok_or(Error::ShuttingDown)
    }

    /// Clone the checkout for the first time, unless that already happened
    ///
    /// Returns once the clone has finished.
    pub async fn populate(&self) -> Result<()> {
        let (done, registry) = {
            let manager = self.manager()?;
            if manager.registry().is_populated(&self.id) {
                return Ok(());
            }
            let done = manager
                .clone_repo(self.source.clone(), self.destination.clone())
                .await?;
            (done, Arc::downgrade(&manager.inner))
        };
        done.wait().await;

        if let Some(inner) = registry.upgrade() {
            inner.registry.populate_done(&self.id);
        }
        debug!(source = %self.source, "Repository populated");
        Ok(())
    }

    async fn pull(&self) -> Result<()> {
        let done = self
            .manager()?
            .pull_repo(self.source.clone(), self.destination.clone())
            .await?;
        done.wait().await;
        Ok(())
    }
}

#[async_trait]
impl WatchedRepo for AutoPullRepo {
    fn id(&self) -> &NodeId {
        &self.id
    }

    async fn updated(&self) {
        let populated = match self.manager() {
            Ok(manager) => manager.registry().is_populated(&self.id),
            Err(_) => {
                debug!(source = %self.source, "Manager is gone; ignoring update");
                return;
            }
        };

        let result = if populated {
            debug!(source = %self.source, "Source changed; pulling");
            self.pull().await
        } else {
            debug!(source = %self.source, "Source changed before first clone; populating");
            self.populate().await
        };
        if let Err(e) = result {
            warn!(source = %self.source, destination = %self.destination, error = %e, "Automatic update failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Fixture;
    use super::*;
    use crate::changes::ChangeEvent;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_populate_clones_once() {
        let fx = Fixture::new();
        let manager = fx.manager(1);
        let repo = manager.watch(fx.source("proj"), Fixture::destination()).unwrap();

        repo.populate().await.unwrap();
        assert!(manager.registry().is_populated(repo.id()));
        assert!(fx.dest_path().join("proj").is_dir());

        repo.populate().await.unwrap();
        assert_eq!(fx.syncer.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_change_batch_triggers_pull() {
        let fx = Fixture::new();
        let manager = fx.manager(2);
        let source = fx.source("proj");
        let scope = source.namespace.clone();
        let repo = manager.watch(source, Fixture::destination()).unwrap();
        assert_eq!(fx.feed.registrations(), 1);

        // First notification populates, the second pulls.
        for expected in 1..=2 {
            fx.feed.deliver(
                &scope,
                ChangeEvent::BatchChanges {
                    affected: vec![repo.id().clone()],
                },
            );
            timeout(Duration::from_secs(10), manager.wait_for_updates())
                .await
                .unwrap();
            assert_eq!(fx.syncer.calls().len(), expected);
        }
        assert!(manager.registry().is_populated(repo.id()));
    }

    #[tokio::test]
    async fn test_watching_two_repos_subscribes_once() {
        let fx = Fixture::new();
        let manager = fx.manager(1);
        manager.watch(fx.source("one"), Fixture::destination()).unwrap();
        manager.watch(fx.source("two"), Fixture::destination()).unwrap();
        assert_eq!(fx.feed.registrations(), 1);
    }

    #[tokio::test]
    async fn test_watch_missing_source_fails() {
        let fx = Fixture::new();
        let manager = fx.manager(1);
        let source = SourceRepo::parse("teamA/missing", "master").unwrap();
        assert!(manager.watch(source, Fixture::destination()).is_err());
    }

    #[tokio::test]
    async fn test_update_after_manager_dropped_is_ignored() {
        let fx = Fixture::new();
        let manager = fx.manager(1);
        let repo = manager.watch(fx.source("proj"), Fixture::destination()).unwrap();
        drop(manager);

        repo.updated().await;
        assert!(matches!(repo.populate().await, Err(Error::ShuttingDown)));
        assert!(fx.syncer.calls().is_empty());
    }
}
