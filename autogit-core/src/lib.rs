//! Autogit Core - background clone/pull coordination for a shared file store
//!
//! This crate keeps checkouts of source repository branches up to date inside
//! a store shared by several independent processes. Duplicate requests are
//! coalesced in-process, and a file-based lease keeps processes from working
//! on the same checkout at once.

pub mod changes;
pub mod clock;
pub mod config;
pub mod error;
pub mod git;
pub mod lease;
pub mod manager;
pub mod registry;
pub mod request;
pub mod signal;
pub mod store;
mod tracker;

pub use changes::{ChangeEvent, ChangeFeed, ChangeSink, FsChangeFeed, NodeId};
pub use clock::{Clock, CommonClock, FixedOffset, NoOffset, OffsetSource, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use git::{GitSyncer, Syncer};
pub use lease::{LeaseCoordinator, LeaseStatus};
pub use manager::{AutoPullRepo, AutogitManager, Collaborators, ManagerOptions, RepoStatus};
pub use registry::{RepoRegistry, WatchedRepo};
pub use request::{Destination, Namespace, SourceRepo};
pub use signal::DoneSignal;
pub use store::{DestinationFs, JobWorkspace, LocalStore, Store};

/// Debug tag attached to every autogit operation's span
pub(crate) fn new_op_id() -> String {
    format!("AGM-{}", uuid::Uuid::new_v4())
}
