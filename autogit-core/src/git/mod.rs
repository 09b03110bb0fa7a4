//! Git operations for Autogit
//!
//! Clone and pull are the same operation here: make a destination directory
//! match the tree of a source branch.

mod reset;

pub use reset::{branch_ref, GitSyncer};

#[cfg(test)]
pub(crate) use reset::testing;

use std::path::Path;

use crate::store::JobWorkspace;
use crate::Result;

/// Materializes a source branch into a destination directory
pub trait Syncer: Send + Sync {
    /// Make `destination` match `branch` of the repository at `source`
    ///
    /// `workspace` is scratch space owned by the calling job.
    fn reset(
        &self,
        workspace: &JobWorkspace,
        source: &Path,
        destination: &Path,
        branch: &str,
    ) -> Result<()>;
}
