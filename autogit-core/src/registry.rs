//! Registry of watched repositories
//!
//! Maps store nodes to the logical repositories that care about them. When
//! the change feed reports a batch touching a registered node, the
//! repository's update hook runs as its own tracked task; delivery never
//! waits for it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::changes::{ChangeEvent, ChangeFeed, ChangeSink, NodeId};
use crate::request::Namespace;
use crate::signal::TaskGroup;
use crate::Result;

/// A logical repository that reacts to changes in the store
#[async_trait]
pub trait WatchedRepo: Send + Sync {
    /// Identity of this repository, used for population tracking
    fn id(&self) -> &NodeId;

    /// Called after something the repository watches has changed
    async fn updated(&self);
}

#[derive(Default)]
struct RegistryState {
    registered_scopes: HashSet<Namespace>,
    repos: HashMap<NodeId, Arc<dyn WatchedRepo>>,
    populated: HashSet<NodeId>,
}

/// Watched-node registry and change sink
pub struct RepoRegistry {
    state: RwLock<RegistryState>,
    feed: Arc<dyn ChangeFeed>,
    updating: TaskGroup,
    runtime: Handle,
    me: Weak<RepoRegistry>,
}

impl std::fmt::Debug for RepoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoRegistry")
            .field("updating", &self.updating.running())
            .finish_non_exhaustive()
    }
}

/// Forwards feed events to the registry without keeping it alive
struct RegistrySink(Weak<RepoRegistry>);

impl ChangeSink for RegistrySink {
    fn on_change(&self, event: ChangeEvent) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_change(event);
        }
    }
}

impl RepoRegistry {
    /// Create a registry fed by `feed`; hooks run on `runtime`
    pub fn new(feed: Arc<dyn ChangeFeed>, runtime: Handle) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: RwLock::new(RegistryState::default()),
            feed,
            updating: TaskGroup::new(),
            runtime,
            me: me.clone(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route changes to `node` to `repo`
    ///
    /// The first watch in a scope subscribes to that scope's change feed. If
    /// the subscription fails the node stays registered and the next watch in
    /// the scope retries it.
    pub fn watch(&self, node: NodeId, scope: &Namespace, repo: Arc<dyn WatchedRepo>) -> Result<()> {
        let mut state = self.write();
        state.repos.insert(node, repo);
        if state.registered_scopes.contains(scope) {
            return Ok(());
        }

        let sink: Arc<dyn ChangeSink> = Arc::new(RegistrySink(self.me.clone()));
        if let Err(e) = self.feed.register_for_changes(scope, sink) {
            warn!(scope = %scope, error = %e, "Error registering for changes");
            return Err(e);
        }
        state.registered_scopes.insert(scope.clone());
        Ok(())
    }

    /// Whether a node is currently watched
    pub fn is_watched(&self, node: &NodeId) -> bool {
        self.read().repos.contains_key(node)
    }

    /// Whether the repository has finished its initial population
    pub fn is_populated(&self, repo: &NodeId) -> bool {
        self.read().populated.contains(repo)
    }

    /// Record that the repository finished its initial population
    pub fn populate_done(&self, repo: &NodeId) {
        self.write().populated.insert(repo.clone());
    }

    /// Number of update hooks still running
    pub fn updating(&self) -> usize {
        self.updating.running()
    }

    /// Wait for every update hook started so far to finish
    pub async fn wait_for_updates(&self) {
        self.updating.wait().await;
    }

    fn notify_nodes(&self, affected: &[NodeId]) {
        let state = self.read();
        for id in affected {
            let Some(repo) = state.repos.get(id) else {
                continue;
            };
            let repo = repo.clone();
            let span = info_span!("autogit_op", op_id = %crate::new_op_id(), node = %id.path().display());
            self.updating.spawn(&self.runtime, async move { repo.updated().await }.instrument(span));
        }
    }
}

impl ChangeSink for RepoRegistry {
    fn on_change(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::BatchChanges { affected } => self.notify_nodes(&affected),
            ChangeEvent::LocalChange { node } => {
                trace!(node = %node.path().display(), "Ignoring local change");
            }
            ChangeEvent::HandleChange { namespace } => {
                debug!(namespace = %namespace, "Ignoring namespace handle change");
            }
        }
    }
}
