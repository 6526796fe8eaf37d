//! stepline CLI entry point.
//!
//! Binary name: `stepline`
//!
//! Parses arguments, initializes tracing and application state, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use stepline_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        json: cli.json,
        otel: cli.otel,
        ..TracingOptions::default()
    }
    .with_verbosity(cli.verbose);
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }
        Commands::Execution { action } => {
            cli::execution::handle_execution_command(action, &state, cli.json).await
        }
        Commands::Worker { concurrency } => {
            cli::worker::run_worker(&state, concurrency, cli.json).await
        }
    };

    state.db_pool.close().await;
    result
}
