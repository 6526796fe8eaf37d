//! In-memory repository for embedding and tests.
//!
//! Implements both `WorkflowRepository` and `ExecutionRepository` over a
//! single mutex-guarded state, which makes every operation trivially atomic.
//! Clones share the same state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stepline_types::error::RepositoryError;
use stepline_types::execution::{Execution, ExecutionStatus, StepAttempt};
use stepline_types::workflow::{Step, Workflow, WorkflowStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::execution::{ExecutionRepository, RecoveryQuery};
use super::workflow::WorkflowRepository;

#[derive(Default)]
struct MemoryState {
    workflows: HashMap<Uuid, Workflow>,
    executions: HashMap<Uuid, Execution>,
    keys: HashMap<String, Uuid>,
    attempts: Vec<StepAttempt>,
}

/// Repository that keeps everything in process memory.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored executions.
    pub async fn execution_count(&self) -> usize {
        self.state.lock().await.executions.len()
    }
}

impl WorkflowRepository for InMemoryRepository {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        if state.workflows.values().any(|w| w.name == workflow.name) {
            return Err(RepositoryError::Conflict(format!(
                "workflow name '{}' already exists",
                workflow.name
            )));
        }
        let mut stored = workflow.clone();
        stored.steps.clear();
        state.workflows.insert(workflow.id, stored);
        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.state.lock().await.workflows.get(id).cloned())
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .await
            .workflows
            .values()
            .find(|w| w.name == name)
            .cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let mut workflows: Vec<Workflow> =
            self.state.lock().await.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn append_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let workflow = state
            .workflows
            .get_mut(&step.workflow_id)
            .ok_or(RepositoryError::NotFound)?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(RepositoryError::UnexpectedStatus(workflow.status));
        }
        if workflow.steps.iter().any(|s| s.position == step.position) {
            return Err(RepositoryError::Conflict(format!(
                "position {} already taken",
                step.position
            )));
        }
        if workflow.steps.iter().any(|s| s.name == step.name) {
            return Err(RepositoryError::Conflict(format!(
                "step name '{}' already taken",
                step.name
            )));
        }
        workflow.steps.push(step.clone());
        workflow.steps.sort_by_key(|s| s.position);
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn update_workflow_status(
        &self,
        id: &Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let workflow = state.workflows.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if workflow.status != from {
            return Err(RepositoryError::UnexpectedStatus(workflow.status));
        }
        workflow.status = to;
        workflow.updated_at = Utc::now();
        Ok(())
    }
}

impl ExecutionRepository for InMemoryRepository {
    async fn insert_if_absent(
        &self,
        execution: &Execution,
    ) -> Result<(Execution, bool), RepositoryError> {
        let mut state = self.state.lock().await;
        if let Some(existing_id) = state.keys.get(&execution.idempotency_key) {
            let existing = state
                .executions
                .get(existing_id)
                .cloned()
                .ok_or(RepositoryError::NotFound)?;
            return Ok((existing, false));
        }
        state
            .keys
            .insert(execution.idempotency_key.clone(), execution.id);
        state.executions.insert(execution.id, execution.clone());
        Ok((execution.clone(), true))
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.state.lock().await.executions.get(id).cloned())
    }

    async fn get_execution_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .keys
            .get(idempotency_key)
            .and_then(|id| state.executions.get(id))
            .cloned())
    }

    async fn claim_execution(
        &self,
        id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(execution) = state.executions.get_mut(id) else {
            return Ok(None);
        };

        let claimable = match execution.status {
            ExecutionStatus::Pending => true,
            ExecutionStatus::Retrying => execution.next_attempt_at.is_none_or(|at| at <= now),
            ExecutionStatus::Running => execution.leased_at.is_none_or(|at| at < stale_before),
            ExecutionStatus::Completed | ExecutionStatus::Failed => false,
        };
        if !claimable {
            return Ok(None);
        }

        execution.status = ExecutionStatus::Running;
        execution.owner = Some(worker.to_string());
        execution.leased_at = Some(now);
        execution.next_attempt_at = None;
        execution.started_at.get_or_insert(now);
        execution.updated_at = now;
        Ok(Some(execution.clone()))
    }

    async fn renew_lease(
        &self,
        id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        match state.executions.get_mut(id) {
            Some(execution)
                if execution.status == ExecutionStatus::Running
                    && execution.owner.as_deref() == Some(worker) =>
            {
                execution.leased_at = Some(now);
                execution.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_attempt(
        &self,
        execution: &Execution,
        attempt: &StepAttempt,
        worker: &str,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.executions.get_mut(&execution.id) else {
            return Ok(false);
        };
        if stored.status.is_terminal() || stored.owner.as_deref() != Some(worker) {
            return Ok(false);
        }
        *stored = execution.clone();
        state.attempts.push(attempt.clone());
        Ok(true)
    }

    async fn list_attempts(&self, execution_id: &Uuid) -> Result<Vec<StepAttempt>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .await
            .attempts
            .iter()
            .filter(|a| &a.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let state = self.state.lock().await;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| workflow_id.is_none_or(|id| &e.workflow.workflow_id == id))
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(limit as usize);
        Ok(executions)
    }

    async fn list_recoverable(&self, query: &RecoveryQuery) -> Result<Vec<Uuid>, RepositoryError> {
        let state = self.state.lock().await;
        let mut candidates: Vec<&Execution> = state
            .executions
            .values()
            .filter(|e| match e.status {
                ExecutionStatus::Pending => e.created_at < query.pending_before,
                ExecutionStatus::Running => e.leased_at.is_none_or(|at| at < query.lease_before),
                ExecutionStatus::Retrying => e.next_attempt_at.is_none_or(|at| at <= query.due_by),
                ExecutionStatus::Completed | ExecutionStatus::Failed => false,
            })
            .collect();
        candidates.sort_by_key(|e| e.created_at);
        Ok(candidates
            .into_iter()
            .take(query.limit as usize)
            .map(|e| e.id)
            .collect())
    }
}
