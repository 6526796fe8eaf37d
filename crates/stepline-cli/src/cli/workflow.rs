//! CLI workflow authoring subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use stepline_types::workflow::{NewStep, TaskType, Workflow};

use super::workflow_status_color;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Create a draft workflow.
    Create {
        /// Unique workflow name.
        name: String,

        #[arg(long, short = 'd')]
        description: Option<String>,
    },

    /// Append a step to a draft workflow.
    AddStep {
        /// Workflow name or ID.
        workflow: String,

        /// Step name, unique within the workflow.
        name: String,

        /// Task type executed by the step.
        #[arg(long, default_value = TaskType::HTTP_REQUEST)]
        task: String,

        /// Task configuration as JSON.
        #[arg(long, default_value = "{}")]
        config: String,

        /// Per-invocation time bound in seconds.
        #[arg(long)]
        timeout: Option<u64>,

        /// Retry ceiling for this step.
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Freeze a draft workflow so executions can start.
    Activate {
        /// Workflow name or ID.
        workflow: String,
    },

    /// Stop accepting new executions for a workflow.
    Archive {
        /// Workflow name or ID.
        workflow: String,
    },

    /// List workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow and its steps.
    Show {
        /// Workflow name or ID.
        workflow: String,
    },
}

pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Create { name, description } => {
            let workflow = state
                .workflow_service
                .create_workflow(&name, description)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&workflow)?);
            } else {
                println!();
                println!(
                    "  {} Created draft workflow '{}'",
                    style("*").green().bold(),
                    style(&workflow.name).cyan()
                );
                println!("  ID: {}", workflow.id);
                println!(
                    "  Add steps with: {}",
                    style(format!("stepline workflow add-step {} <step> --config '{{...}}'", workflow.name)).dim()
                );
                println!();
            }
            Ok(())
        }
        WorkflowCommand::AddStep {
            workflow,
            name,
            task,
            config,
            timeout,
            max_attempts,
        } => {
            let target = resolve(state, &workflow).await?;
            let config: serde_json::Value =
                serde_json::from_str(&config).context("--config is not valid JSON")?;
            let step = state
                .workflow_service
                .add_step(
                    &target.id,
                    NewStep {
                        name,
                        task_type: TaskType::from(task),
                        config,
                        timeout_secs: timeout,
                        max_attempts,
                    },
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&step)?);
            } else {
                println!();
                println!(
                    "  {} Added step {} '{}' ({}) to '{}'",
                    style("*").green().bold(),
                    step.position,
                    style(&step.name).cyan(),
                    step.task_type,
                    target.name
                );
                println!();
            }
            Ok(())
        }
        WorkflowCommand::Activate { workflow } => {
            let target = resolve(state, &workflow).await?;
            let activated = state.workflow_service.activate(&target.id).await?;
            print_status_change(&activated, "Activated", json)
        }
        WorkflowCommand::Archive { workflow } => {
            let target = resolve(state, &workflow).await?;
            let archived = state.workflow_service.archive(&target.id).await?;
            print_status_change(&archived, "Archived", json)
        }
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { workflow } => {
            let target = resolve(state, &workflow).await?;
            display_workflow(&target, json)
        }
    }
}

async fn resolve(state: &AppState, id_or_name: &str) -> Result<Workflow> {
    state
        .workflow_service
        .resolve(id_or_name)
        .await?
        .with_context(|| format!("workflow '{id_or_name}' not found"))
}

fn print_status_change(workflow: &Workflow, verb: &str, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "id": workflow.id.to_string(),
            "name": workflow.name,
            "status": workflow.status,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {verb} workflow '{}'",
            style("*").green().bold(),
            style(&workflow.name).cyan()
        );
        println!();
    }
    Ok(())
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.workflow_service.list().await?;

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "id": w.id.to_string(),
                    "name": w.name,
                    "status": w.status,
                    "steps": w.steps.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows yet.");
        println!(
            "  Create one with: {}",
            style("stepline workflow create <name>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("ID"),
        ]);

    for w in &workflows {
        table.add_row(vec![
            Cell::new(&w.name),
            Cell::new(w.status).fg(workflow_status_color(w.status)),
            Cell::new(w.steps.len()),
            Cell::new(w.id),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn display_workflow(workflow: &Workflow, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(workflow)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} ({})",
        style(&workflow.name).cyan().bold(),
        workflow.status
    );
    println!("  ID: {}", workflow.id);
    if let Some(description) = &workflow.description {
        println!("  {description}");
    }
    println!();

    if workflow.steps.is_empty() {
        println!("  No steps.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Task"),
            Cell::new("Timeout"),
            Cell::new("Max attempts"),
            Cell::new("Config"),
        ]);

    for step in &workflow.steps {
        table.add_row(vec![
            Cell::new(step.position),
            Cell::new(&step.name),
            Cell::new(&step.task_type),
            Cell::new(
                step.timeout_secs
                    .map(|s| format!("{s}s"))
                    .unwrap_or_else(|| "default".to_string()),
            ),
            Cell::new(
                step.max_attempts
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "default".to_string()),
            ),
            Cell::new(step.config.to_string()),
        ]);
    }

    println!("{table}");
    println!();
    Ok(())
}
