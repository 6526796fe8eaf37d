//! CLI command definitions for the `stepline` binary.
//!
//! Commands are grouped by noun (`stepline workflow create`,
//! `stepline execution show`, ...).

pub mod execution;
pub mod worker;
pub mod workflow;

use clap::{Parser, Subcommand};
use comfy_table::Color;
use console::style;
use stepline_types::execution::ExecutionStatus;
use stepline_types::workflow::WorkflowStatus;

/// Durable multi-step workflow execution.
#[derive(Parser)]
#[command(name = "stepline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Author and inspect workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start and inspect executions.
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Run the worker pool until interrupted.
    Worker {
        /// Number of concurrent workers (overrides config.toml).
        #[arg(long, short = 'c')]
        concurrency: Option<usize>,
    },
}

pub(crate) fn workflow_status_color(status: WorkflowStatus) -> Color {
    match status {
        WorkflowStatus::Draft => Color::Yellow,
        WorkflowStatus::Active => Color::Green,
        WorkflowStatus::Archived => Color::DarkGrey,
    }
}

pub(crate) fn execution_status_color(status: ExecutionStatus) -> Color {
    match status {
        ExecutionStatus::Pending => Color::Yellow,
        ExecutionStatus::Running => Color::Cyan,
        ExecutionStatus::Retrying => Color::Magenta,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
    }
}

pub(crate) fn styled_execution_status(status: ExecutionStatus) -> String {
    let text = status.to_string();
    match status {
        ExecutionStatus::Completed => style(text).green().to_string(),
        ExecutionStatus::Failed => style(text).red().to_string(),
        ExecutionStatus::Retrying => style(text).magenta().to_string(),
        ExecutionStatus::Running => style(text).cyan().to_string(),
        ExecutionStatus::Pending => style(text).yellow().to_string(),
    }
}
