//! Workflow definition types.
//!
//! A `Workflow` is a named, strictly linear sequence of `Step`s. Workflows are
//! authored in `Draft`, frozen by activation, and executions always run from a
//! `WorkflowSnapshot` taken at creation time so later edits never leak into
//! in-flight or historical runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Steps may still be appended.
    Draft,
    /// Frozen; executions may be created.
    Active,
    /// Retired; no new executions.
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, ordered sequence of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned on creation.
    pub id: Uuid,
    /// Human-chosen name, unique across workflows.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Current lifecycle status.
    pub status: WorkflowStatus,
    /// Steps ordered by `position` (dense, zero-based).
    #[serde(default)]
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Whether executions may be created against this workflow.
    pub fn is_runnable(&self) -> bool {
        self.status == WorkflowStatus::Active && !self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The kind of work a step performs.
///
/// Stored and serialized as its string name. Names without a built-in variant
/// become `Custom`, so new task types only need a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    /// Outbound HTTP call.
    HttpRequest,
    /// Any other task type, dispatched by name.
    Custom(String),
}

impl TaskType {
    pub const HTTP_REQUEST: &'static str = "http_request";

    pub fn as_str(&self) -> &str {
        match self {
            TaskType::HttpRequest => Self::HTTP_REQUEST,
            TaskType::Custom(name) => name,
        }
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        match value.as_str() {
            TaskType::HTTP_REQUEST => TaskType::HttpRequest,
            _ => TaskType::Custom(value),
        }
    }
}

impl From<&str> for TaskType {
    fn from(value: &str) -> Self {
        TaskType::from(value.to_string())
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// UUIDv7 step ID.
    pub id: Uuid,
    /// Owning workflow.
    pub workflow_id: Uuid,
    /// Step name, unique within the workflow. Keys the step's output.
    pub name: String,
    /// Task type the step executor dispatches on.
    pub task_type: TaskType,
    /// Zero-based execution order, dense and unique per workflow.
    pub position: u32,
    /// Opaque task configuration interpreted by the task handler.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Per-step execution time bound in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Per-step attempt ceiling (overrides the retry policy default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Request to append a step to a draft workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only copy of a workflow taken when an execution is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: Uuid,
    pub name: String,
    pub steps: Vec<Step>,
}

impl From<&Workflow> for WorkflowSnapshot {
    fn from(workflow: &Workflow) -> Self {
        let mut steps = workflow.steps.clone();
        steps.sort_by_key(|s| s.position);
        Self {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
            steps,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
