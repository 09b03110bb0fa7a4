//! Status command - show the lease and placeholder state of a checkout

use chrono::Utc;
use clap::Args;

use autogit_core::{Config, Destination, RepoStatus};

use super::start_manager;

/// Show the state of a checkout
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Destination directory (namespace[/dir])
    destination: String,

    /// Checkout name
    repo: String,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

impl StatusArgs {
    /// Execute the status command
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let destination = Destination::parse(&self.destination)?;
        let manager = start_manager(config)?;
        let status = manager.status(&destination, &self.repo).await?;
        manager.shutdown().await;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            print_status(&status);
        }
        Ok(())
    }
}

/// Print a human-readable status block
pub fn print_status(status: &RepoStatus) {
    println!();
    println!("{}/{}", status.destination, status.repo);

    if !status.exists {
        println!("  Checkout: missing");
    } else if status.cloning {
        println!("  Checkout: waiting for first clone");
    } else {
        println!("  Checkout: present");
    }

    match status.lease.working_since {
        Some(since) => {
            let ago = format_duration((Utc::now() - since).num_seconds());
            let state = if status.lease.live { "working" } else { "expired" };
            println!("  Lease: {} (since {} ago)", state, ago);
        }
        None => println!("  Lease: free"),
    }

    if let Some(err) = &status.lease.last_error {
        println!("  Last error: {}", err);
    }
    println!();
}

/// Format seconds as a short human duration
fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else if seconds < 86400 {
        let hours = seconds / 3600;
        let mins = (seconds % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = seconds / 86400;
        let hours = (seconds % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(-5), "0s");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m");
        assert_eq!(format_duration(3600), "1h");
        assert_eq!(format_duration(3660), "1h 1m");
        assert_eq!(format_duration(90000), "1d 1h");
    }
}
