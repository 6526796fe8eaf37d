//! Execution tracking types.
//!
//! An `Execution` is one run of a workflow snapshot, driven through
//! `ExecutionStatus` by a single owning worker at a time. Every invocation of
//! a step's task is recorded as a `StepAttempt` in an append-only audit log.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{Step, WorkflowSnapshot};

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
///
/// ```text
/// PENDING  -> RUNNING
/// RUNNING  -> COMPLETED | RETRYING | FAILED
/// RETRYING -> RUNNING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Retrying => "retrying",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Running -> Running` is the takeover of a stranded execution by a new
    /// owner; it never changes the step index or counters.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Retrying, Running)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow, tracked to a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// Workflow as it was when the execution was created.
    pub workflow: WorkflowSnapshot,
    /// Caller-supplied key, unique across all executions.
    pub idempotency_key: String,
    pub status: ExecutionStatus,
    /// Index of the next step to run. Only ever advances.
    pub current_step_index: u32,
    /// Failed attempts so far, keyed by step index.
    #[serde(default)]
    pub attempt_counts: BTreeMap<u32, u32>,
    /// Step results keyed by step name. Append-only.
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,
    /// Final unretryable failure. Set only when `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker currently holding the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// When the current owner acquired or last refreshed its lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leased_at: Option<DateTime<Utc>>,
    /// Earliest time a `Retrying` execution may be picked up again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// A fresh `Pending` execution for the given snapshot.
    pub fn new(workflow: WorkflowSnapshot, idempotency_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow,
            idempotency_key: idempotency_key.into(),
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            attempt_counts: BTreeMap::new(),
            output: serde_json::Map::new(),
            error: None,
            owner: None,
            leased_at: None,
            next_attempt_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// The step at `current_step_index`, if any remain.
    pub fn current_step(&self) -> Option<&Step> {
        self.workflow.steps.get(self.current_step_index as usize)
    }

    /// Failed attempts recorded for a step index (0 when absent).
    pub fn attempts_for(&self, step_index: u32) -> u32 {
        self.attempt_counts.get(&step_index).copied().unwrap_or(0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Step failures
// ---------------------------------------------------------------------------

/// Classification of a step failure, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The task exceeded its execution time bound.
    Timeout,
    /// A dependency could not be reached or reported itself unavailable.
    Unavailable,
    /// The dependency answered, but not with an acceptable result.
    InvalidResponse,
    /// The step's configuration cannot be executed as written.
    ConfigurationError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::InvalidResponse => "invalid_response",
            FailureKind::ConfigurationError => "configuration_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure returned by a step's task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct StepExecutionError {
    pub kind: FailureKind,
    pub detail: String,
}

impl StepExecutionError {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, detail)
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, detail)
    }

    pub fn invalid_response(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidResponse, detail)
    }

    pub fn configuration(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::ConfigurationError, detail)
    }
}

// ---------------------------------------------------------------------------
// Step attempts (audit log)
// ---------------------------------------------------------------------------

/// Outcome of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// One audited invocation of a step's task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    /// UUIDv7 attempt ID.
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_index: u32,
    /// Step name (denormalized for display).
    pub step_name: String,
    /// 1-based attempt number for this step.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
