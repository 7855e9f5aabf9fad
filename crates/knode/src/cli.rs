//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use knode_cleanup::{Cleanup, CleanupConfig};
use knode_common::{KnodeError, KnodePaths};

/// Knode - Node Lifecycle Manager
#[derive(Parser)]
#[command(name = "knode")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data directory for knode
    #[arg(
        long,
        global = true,
        env = "KNODE_DATA_DIR",
        default_value = "/var/lib/knode"
    )]
    pub data_dir: PathBuf,

    /// Runtime directory for knode
    #[arg(long, global = true, env = "KNODE_RUN_DIR", default_value = "/run/knode")]
    pub run_dir: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Node lifecycle commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Uninstall this node: erase the knode-owned directories,
    /// unmounting anything mounted beneath them
    Reset {
        /// Proceed without asking for confirmation
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Execute the parsed command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub fn execute(self) -> Result<()> {
        let paths = KnodePaths::with_dirs(&self.data_dir, &self.run_dir);

        match self.command {
            Commands::Reset { force } => reset(&paths, force),
        }
    }
}

/// Run the uninstall flow.
fn reset(paths: &KnodePaths, force: bool) -> Result<()> {
    if !rustix::process::geteuid().is_root() {
        return Err(KnodeError::PermissionDenied {
            operation: "reset (unmounts filesystems and removes system directories)".to_string(),
        }
        .into());
    }

    if !force && !confirm_reset(paths)? {
        println!("Aborted.");
        return Ok(());
    }

    tracing::warn!(
        data_dir = %paths.data.display(),
        run_dir = %paths.run.display(),
        "Resetting node; this erases all knode data"
    );

    let config = CleanupConfig::new(paths);
    Cleanup::new(&config)
        .run()
        .map_err(|e| color_eyre::eyre::eyre!("Reset did not complete cleanly: {}", e))?;

    println!("Node reset complete. A reboot is recommended.");
    Ok(())
}

/// Ask the operator to confirm the irreversible reset.
fn confirm_reset(paths: &KnodePaths) -> Result<bool> {
    use std::io::{BufRead, Write};

    print!(
        "This will erase {} and {}. Continue? [y/N] ",
        paths.data.display(),
        paths.run.display()
    );
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn reset_parses_with_custom_dirs() {
        let cli = Cli::parse_from([
            "knode",
            "--data-dir",
            "/tmp/knode-data",
            "--run-dir",
            "/tmp/knode-run",
            "reset",
            "--force",
        ]);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/knode-data"));
        assert!(matches!(cli.command, Commands::Reset { force: true }));
    }
}
