//! Engine facade.
//!
//! Wires the idempotency guard, state machine, worker pool and reconciler
//! over one set of repositories and one dispatch queue.

use std::sync::Arc;
use std::time::Duration;

use stepline_types::config::EngineConfig;
use stepline_types::execution::{Execution, StepAttempt};
use uuid::Uuid;

use super::error::EngineError;
use super::idempotency::IdempotencyGuard;
use super::queue::DispatchQueue;
use super::retry::RetryPolicy;
use super::state_machine::ExecutionStateMachine;
use super::step_executor::StepExecutor;
use super::worker::{WorkerPool, WorkerPoolHandle};
use crate::repository::execution::ExecutionRepository;
use crate::repository::workflow::WorkflowRepository;

/// Fraction of the liveness threshold between lease renewals.
const LEASE_RENEWALS_PER_THRESHOLD: u32 = 4;

pub struct Engine<W, E, Q>
where
    W: WorkflowRepository,
    E: ExecutionRepository,
    Q: DispatchQueue,
{
    guard: IdempotencyGuard<W, E, Q>,
    executions: Arc<E>,
    queue: Arc<Q>,
    machine: Arc<ExecutionStateMachine<E>>,
    config: EngineConfig,
}

impl<W, E, Q> Engine<W, E, Q>
where
    W: WorkflowRepository,
    E: ExecutionRepository + 'static,
    Q: DispatchQueue + 'static,
{
    pub fn new(
        workflows: Arc<W>,
        executions: Arc<E>,
        queue: Arc<Q>,
        executor: StepExecutor,
        config: EngineConfig,
    ) -> Self {
        let lease_renewal = config.reconciler.liveness_threshold() / LEASE_RENEWALS_PER_THRESHOLD;
        let machine = Arc::new(ExecutionStateMachine::new(
            executions.clone(),
            Arc::new(executor),
            RetryPolicy::from_config(&config.retry),
            lease_renewal,
        ));
        Self {
            guard: IdempotencyGuard::new(workflows, executions.clone(), queue.clone()),
            executions,
            queue,
            machine,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create (or replay) the execution for `idempotency_key`.
    pub async fn create_execution(
        &self,
        workflow_id: &Uuid,
        idempotency_key: &str,
    ) -> Result<Execution, EngineError> {
        self.guard.create_execution(workflow_id, idempotency_key).await
    }

    /// Start the worker pool and reconciler.
    pub fn start(&self) -> WorkerPoolHandle {
        WorkerPool::new(
            self.executions.clone(),
            self.queue.clone(),
            self.machine.clone(),
            self.config.worker.clone(),
            self.config.reconciler.clone(),
        )
        .start()
    }

    pub async fn execution(&self, id: &Uuid) -> Result<Execution, EngineError> {
        self.executions
            .get_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(*id))
    }

    /// Step-attempt audit log, oldest first.
    pub async fn attempts(&self, id: &Uuid) -> Result<Vec<StepAttempt>, EngineError> {
        Ok(self.executions.list_attempts(id).await?)
    }

    /// Poll until the execution is terminal or `timeout` elapses, returning
    /// the last observed state either way.
    pub async fn wait_for_terminal(
        &self,
        id: &Uuid,
        timeout: Duration,
    ) -> Result<Execution, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = self.config.worker.poll_interval().max(Duration::from_millis(10));
        loop {
            let execution = self.execution(id).await?;
            if execution.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(execution);
            }
            tokio::time::sleep(poll.min(deadline - tokio::time::Instant::now())).await;
        }
    }
}
