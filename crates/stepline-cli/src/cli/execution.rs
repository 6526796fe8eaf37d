//! CLI execution subcommands: create, show, logs, list.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepline_core::repository::execution::ExecutionRepository;
use stepline_types::execution::{AttemptOutcome, Execution, StepAttempt};
use uuid::Uuid;

use super::{execution_status_color, styled_execution_status};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// Start an execution of an active workflow.
    ///
    /// Re-running with the same key returns the existing execution.
    Create {
        /// Workflow name or ID.
        workflow: String,

        /// Idempotency key identifying this request.
        #[arg(long)]
        key: String,

        /// Run workers in this process and wait up to SECS for a terminal state.
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },

    /// Show an execution's state and step outputs.
    Show {
        /// Execution ID.
        id: Uuid,
    },

    /// Show the step-attempt audit trail of an execution.
    Logs {
        /// Execution ID.
        id: Uuid,
    },

    /// List recent executions.
    #[command(alias = "ls")]
    List {
        /// Only executions of this workflow (name or ID).
        #[arg(long)]
        workflow: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

pub async fn handle_execution_command(
    cmd: ExecutionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecutionCommand::Create { workflow, key, wait } => {
            handle_create(state, &workflow, &key, wait, json).await
        }
        ExecutionCommand::Show { id } => {
            let execution = state
                .executions
                .get_execution(&id)
                .await?
                .with_context(|| format!("execution {id} not found"))?;
            display_execution(&execution, json)
        }
        ExecutionCommand::Logs { id } => {
            let attempts = state.executions.list_attempts(&id).await?;
            display_attempts(&id, &attempts, json)
        }
        ExecutionCommand::List { workflow, limit } => {
            handle_list(state, workflow.as_deref(), limit, json).await
        }
    }
}

async fn handle_create(
    state: &AppState,
    workflow: &str,
    key: &str,
    wait: Option<u64>,
    json: bool,
) -> Result<()> {
    let target = state
        .workflow_service
        .resolve(workflow)
        .await?
        .with_context(|| format!("workflow '{workflow}' not found"))?;

    let engine = state.engine()?;
    let mut execution = engine.create_execution(&target.id, key).await?;

    if let Some(secs) = wait.filter(|_| !execution.is_terminal()) {
        let pool = engine.start();
        let waited = engine
            .wait_for_terminal(&execution.id, Duration::from_secs(secs))
            .await;
        pool.shutdown().await;
        execution = waited?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Execution of '{}' for key '{}'",
        style("*").green().bold(),
        style(&target.name).cyan(),
        execution.idempotency_key
    );
    println!("  ID: {}", execution.id);
    println!("  Status: {}", styled_execution_status(execution.status));
    if !execution.is_terminal() {
        println!();
        println!(
            "  Run workers with: {}",
            style("stepline worker").dim()
        );
        println!(
            "  Check progress:   {}",
            style(format!("stepline execution show {}", execution.id)).dim()
        );
    } else if let Some(error) = &execution.error {
        println!("  Error: {}", style(error).red());
    }
    println!();
    Ok(())
}

async fn handle_list(
    state: &AppState,
    workflow: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let workflow_id = match workflow {
        Some(w) => Some(
            state
                .workflow_service
                .resolve(w)
                .await?
                .with_context(|| format!("workflow '{w}' not found"))?
                .id,
        ),
        None => None,
    };
    let executions = state
        .executions
        .list_executions(workflow_id.as_ref(), limit)
        .await?;

    if json {
        let out: Vec<_> = executions
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id.to_string(),
                    "workflow": e.workflow.name,
                    "key": e.idempotency_key,
                    "status": e.status,
                    "step": e.current_step_index,
                    "created_at": e.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!();
        println!("  No executions.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Key"),
            Cell::new("Status"),
            Cell::new("Progress"),
            Cell::new("Created"),
        ]);

    for e in &executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(&e.workflow.name),
            Cell::new(&e.idempotency_key),
            Cell::new(e.status).fg(execution_status_color(e.status)),
            Cell::new(format!("{}/{}", e.current_step_index, e.workflow.steps.len())),
            Cell::new(e.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn display_execution(execution: &Execution, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(execution)?);
        return Ok(());
    }

    println!();
    println!(
        "  Execution {} ({})",
        style(execution.id).cyan().bold(),
        styled_execution_status(execution.status)
    );
    println!("  Workflow: {}", execution.workflow.name);
    println!("  Key: {}", execution.idempotency_key);
    println!(
        "  Progress: {}/{} steps",
        execution.current_step_index,
        execution.workflow.steps.len()
    );
    if let Some(step) = execution.current_step().filter(|_| !execution.is_terminal()) {
        println!(
            "  Next step: {} (failed attempts: {})",
            step.name,
            execution.attempts_for(execution.current_step_index)
        );
    }
    if let Some(at) = execution.next_attempt_at {
        println!("  Next attempt at: {}", at.to_rfc3339());
    }
    if let Some(owner) = &execution.owner {
        println!("  Owner: {owner}");
    }
    println!("  Created: {}", execution.created_at.to_rfc3339());
    if let Some(at) = execution.completed_at {
        println!("  Finished: {}", at.to_rfc3339());
    }
    if let Some(error) = &execution.error {
        println!("  Error: {}", style(error).red());
    }

    if !execution.output.is_empty() {
        println!();
        println!("  Output:");
        let pretty = serde_json::to_string_pretty(&execution.output)?;
        for line in pretty.lines() {
            println!("    {line}");
        }
    }
    println!();
    Ok(())
}

fn display_attempts(id: &Uuid, attempts: &[StepAttempt], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(attempts)?);
        return Ok(());
    }

    if attempts.is_empty() {
        println!();
        println!("  No attempts recorded for {id}.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Attempt"),
            Cell::new("Outcome"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for a in attempts {
        let (outcome, color) = match a.outcome {
            AttemptOutcome::Succeeded => ("succeeded", Color::Green),
            AttemptOutcome::Failed => ("failed", Color::Red),
        };
        let duration = (a.finished_at - a.started_at).num_milliseconds();
        let error = match (&a.error_kind, &a.error) {
            (Some(kind), Some(detail)) => format!("{kind}: {detail}"),
            (None, Some(detail)) => detail.clone(),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(format!("{} {}", a.step_index, a.step_name)),
            Cell::new(a.attempt),
            Cell::new(outcome).fg(color),
            Cell::new(format!("{duration}ms")),
            Cell::new(error),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
