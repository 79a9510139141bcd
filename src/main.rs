use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod system;

use cli::{execute_command, Cli};

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    // Execute the appropriate command
    execute_command(&cli).with_context(|| "command execution failed")
}

// Diagnostics go to stderr, stdout belongs to the operator dialogue
fn setup_logging(verbose: bool) {
    let default_filter = if verbose {
        "managed_packages=debug"
    } else {
        "managed_packages=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();
}
