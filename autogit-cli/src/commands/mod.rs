//! CLI command implementations

pub mod delete;
pub mod status;
pub mod sync;
pub mod watch;

pub use delete::DeleteArgs;
pub use status::StatusArgs;
pub use sync::{SyncArgs, SyncKind};
pub use watch::WatchArgs;

use autogit_core::{AutogitManager, Collaborators, Config, ManagerOptions};

/// Start a manager over the configured local store
pub fn start_manager(config: &Config) -> anyhow::Result<AutogitManager> {
    let collaborators = Collaborators::local(config)?;
    let manager = AutogitManager::start(ManagerOptions::from(&config.manager), collaborators)?;
    Ok(manager)
}
