use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::debug;

use crate::system::Apt;
use managed_packages::{has_pending, plan, Action, PackageStatus, Reconciler};

// Manifest read when no --file is given
const DEFAULT_MANIFEST: &str = "package_management.yml";

// CLI arguments parsing structure
#[derive(Parser)]
#[command(author, version, about, long_about = None, disable_help_subcommand = true)]
pub struct Cli {
    /// Manifest listing packages to install and remove
    #[arg(short = 'f', long, default_value = DEFAULT_MANIFEST)]
    pub file: PathBuf,

    /// Output results in JSON format
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Abort if the installed packages cannot be listed
    #[arg(short = 's', long)]
    pub strict: bool,

    /// Print debug diagnostics to stderr
    #[arg(short = 'v', long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install and remove packages to match the manifest, asking before each change (default)
    Sync,
    /// Show which manifest entries are satisfied without changing anything
    Status,
}

// Execute the selected command
pub fn execute_command(cli: &Cli) -> Result<()> {
    match &cli.command {
        None | Some(Commands::Sync) => cmd_sync(&cli.file, cli.strict),
        Some(Commands::Status) => cmd_status(&cli.file, cli.strict, cli.json),
    }
}

// Command implementations
fn cmd_sync(manifest: &Path, strict: bool) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reconciler = Reconciler::new(Apt::new(), stdin.lock(), stdout.lock()).strict(strict);

    let outcomes = reconciler
        .run(manifest)
        .context("failed to reconcile packages")?;
    debug!(?outcomes, "sync finished");

    Ok(())
}

fn cmd_status(manifest: &Path, strict: bool, json_output: bool) -> Result<()> {
    // Reports go to stderr so stdout stays clean for the listing
    let mut reconciler = Reconciler::new(Apt::new(), io::empty(), io::stderr()).strict(strict);
    let desired = reconciler.load_desired_state(manifest)?;
    let installed = reconciler.installed_packages()?;

    let status_list = plan(&desired, &installed);
    let pending = has_pending(&status_list);

    if json_output {
        let json = serde_json::to_string_pretty(&status_list)
            .context("failed to serialize package status to JSON")?;
        println!("{json}");
    } else if status_list.is_empty() {
        println!("no packages managed");
    } else {
        // Find the longest package name for alignment
        let max_name_length = status_list
            .iter()
            .map(|status| status.name.len())
            .max()
            .unwrap_or(0);

        for status in &status_list {
            print_package_status(status, max_name_length);
        }
    }

    // Exit with non-zero status if the system has not converged
    if pending {
        exit(1);
    }

    Ok(())
}

fn print_package_status(status: &PackageStatus, max_name_length: usize) {
    let status_marker = status.marker();
    let action = match status.action {
        Action::Install => "install",
        Action::Remove => "remove",
    };

    let padded_name = format!("{:<width$}", status.name, width = max_name_length);
    println!("  {status_marker} {padded_name}  {action}");
}
