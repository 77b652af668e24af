//! CLI entry point for rago.
//!
//! This binary provides the `rago` command: `rago rag ...` manages the
//! knowledge base and `rago agent ...` runs the agent and inspects its
//! stored sessions and plans.

mod agent;
mod app;
mod cli;
mod helpers;
mod rag;
mod repl;
mod routed;

use anyhow::Result;
use clap::Parser;
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::helpers::{init_tracing, load_config};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose, cli.global.log_json);

    let config = load_config(&cli.global)?;
    debug!(data_dir = %config.data_dir.display(), "configuration resolved");

    match cli.command {
        Commands::Rag { action } => rag::handle(config, action).await,
        Commands::Agent { action } => agent::handle(config, action).await,
    }
}
