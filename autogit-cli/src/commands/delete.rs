//! Delete command

use clap::Args;

use autogit_core::{Config, Destination};

use super::start_manager;

/// Remove a checkout from a destination directory
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Destination directory (namespace[/dir])
    destination: String,

    /// Checkout to remove
    repo: String,

    /// Branch the checkout tracked
    #[arg(short, long, default_value = "master")]
    branch: String,
}

impl DeleteArgs {
    /// Execute the delete command
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let destination = Destination::parse(&self.destination)?;
        let manager = start_manager(config)?;

        let done = manager.delete_repo(destination.clone(), &self.repo, &self.branch)?;
        done.wait().await;

        let status = manager.status(&destination, &self.repo).await?;
        manager.shutdown().await;

        if status.exists {
            if status.lease.live {
                println!(
                    "{}/{} is being worked on elsewhere; delete skipped",
                    destination, self.repo
                );
            } else {
                anyhow::bail!("Failed to delete {}/{}", destination, self.repo);
            }
        } else {
            println!("Deleted {}/{}", destination, self.repo);
        }
        Ok(())
    }
}
