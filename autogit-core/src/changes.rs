//! Storage change notifications
//!
//! The store reports changes per scope (a namespace). Consumers register a
//! [`ChangeSink`] once per scope and receive [`ChangeEvent`]s from whatever
//! thread the store delivers them on, possibly many at once.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace, warn};

use crate::request::Namespace;
use crate::Result;

/// Identity of a node (file or directory) in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(PathBuf);

impl NodeId {
    /// Identify a node by its canonical path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Canonical path of the node
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// A change reported by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A write made by this process
    LocalChange { node: NodeId },
    /// A batch of changes, usually made elsewhere
    BatchChanges { affected: Vec<NodeId> },
    /// A namespace was renamed or re-keyed
    HandleChange { namespace: Namespace },
}

/// Receiver of change events
pub trait ChangeSink: Send + Sync {
    /// Handle one event; must not block the delivering thread
    fn on_change(&self, event: ChangeEvent);
}

/// Source of change events
pub trait ChangeFeed: Send + Sync {
    /// Deliver every future change under `scope` to `sink`
    fn register_for_changes(&self, scope: &Namespace, sink: Arc<dyn ChangeSink>) -> Result<()>;
}

/// A change feed backed by OS file watching (inotify, fsevents, ...)
///
/// Each event is reported as one batch naming the changed paths and every
/// ancestor directory inside the scope, so a watcher of a repository
/// directory hears about writes anywhere below it.
pub struct FsChangeFeed {
    store_root: PathBuf,
    watchers: Mutex<Vec<RecommendedWatcher>>,
}

impl std::fmt::Debug for FsChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsChangeFeed")
            .field("store_root", &self.store_root)
            .finish_non_exhaustive()
    }
}

impl FsChangeFeed {
    /// Watch namespaces under `store_root`
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            watchers: Mutex::new(Vec::new()),
        }
    }
}

impl ChangeFeed for FsChangeFeed {
    fn register_for_changes(&self, scope: &Namespace, sink: Arc<dyn ChangeSink>) -> Result<()> {
        let scope_root = self.store_root.join(scope.name()).canonicalize()?;

        let filter_root = scope_root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    let affected = affected_nodes(&event, &filter_root);
                    if !affected.is_empty() {
                        sink.on_change(ChangeEvent::BatchChanges { affected });
                    }
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            }
        })?;
        watcher.watch(&scope_root, RecursiveMode::Recursive)?;
        debug!(scope = %scope, path = %scope_root.display(), "Registered for changes");

        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(watcher);
        Ok(())
    }
}

/// Every node inside `scope_root` touched by an event, ancestors included
fn affected_nodes(event: &Event, scope_root: &Path) -> Vec<NodeId> {
    if matches!(event.kind, EventKind::Access(_)) {
        trace!("skipping access event");
        return Vec::new();
    }

    let mut nodes = BTreeSet::new();
    for path in &event.paths {
        for ancestor in path.ancestors() {
            if !ancestor.starts_with(scope_root) {
                break;
            }
            nodes.insert(NodeId::new(ancestor));
        }
    }
    nodes.into_iter().collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::{ChangeEvent, ChangeFeed, ChangeSink};
    use crate::request::Namespace;
    use crate::{Error, Result};

    /// A feed that records registrations and lets tests deliver events
    #[derive(Default)]
    pub(crate) struct ManualFeed {
        sinks: Mutex<Vec<(Namespace, Arc<dyn ChangeSink>)>>,
        fail_next: Mutex<bool>,
    }

    impl ManualFeed {
        /// Make the next registration fail
        pub(crate) fn fail_next_registration(&self) {
            *self.fail_next.lock().unwrap() = true;
        }

        /// Deliver an event to every sink registered for `scope`
        pub(crate) fn deliver(&self, scope: &Namespace, event: ChangeEvent) {
            let sinks: Vec<_> = self
                .sinks
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s == scope)
                .map(|(_, sink)| sink.clone())
                .collect();
            for sink in sinks {
                sink.on_change(event.clone());
            }
        }

        pub(crate) fn registrations(&self) -> usize {
            self.sinks.lock().unwrap().len()
        }
    }

    impl ChangeFeed for ManualFeed {
        fn register_for_changes(&self, scope: &Namespace, sink: Arc<dyn ChangeSink>) -> Result<()> {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(Error::Other("feed unavailable".to_string()));
            }
            self.sinks.lock().unwrap().push((scope.clone(), sink));
            Ok(())
        }
    }
}
