//! Watch command - keep every repository of a namespace checked out

use clap::Args;

use autogit_core::{Config, Destination, LocalStore, Namespace, SourceRepo};

use super::start_manager;

/// Mirror a namespace's repositories into a destination until interrupted
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Source namespace whose repositories are mirrored
    namespace: String,

    /// Destination directory (namespace[/dir])
    destination: String,

    /// Branch to follow
    #[arg(short, long, default_value = "master")]
    branch: String,
}

impl WatchArgs {
    /// Execute the watch command
    pub async fn execute(&self, verbose: bool, config: &Config) -> anyhow::Result<()> {
        let namespace = Namespace::parse(&self.namespace)?;
        let destination = Destination::parse(&self.destination)?;
        let store = LocalStore::new(config.store.root_or_default()?);

        let repos = store.list_source_repos(&namespace)?;
        if repos.is_empty() {
            anyhow::bail!("No repositories found in {}", namespace);
        }

        let manager = start_manager(config)?;
        let mut watched = Vec::new();
        for name in &repos {
            let source = SourceRepo::new(namespace.clone(), name, &self.branch)?;
            watched.push(manager.watch(source, destination.clone())?);
        }
        println!(
            "Watching {} repositories in {} -> {}",
            watched.len(),
            namespace,
            destination
        );

        for repo in &watched {
            if let Err(e) = repo.populate().await {
                eprintln!("Failed to populate {}: {}", repo.source(), e);
            } else if verbose {
                println!("  populated {}", repo.source());
            }
        }

        println!("Press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;

        println!("Stopping...");
        manager.shutdown().await;
        manager.wait_for_updates().await;
        Ok(())
    }
}
