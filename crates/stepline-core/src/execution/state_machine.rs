//! Execution state machine.
//!
//! Applies lifecycle transitions to an `Execution` and runs the per-step
//! procedure for an execution a worker has claimed:
//!
//! 1. Attempt number for the current step is its failed-attempt count + 1.
//! 2. Invoke the step executor while renewing the worker's lease.
//! 3. Success: store the result under the step name, advance the index,
//!    and complete the execution after the last step.
//! 4. Failure: ask the retry policy; either park the execution in
//!    `Retrying` with a stored `next_attempt_at`, or fail it.
//!
//! Every attempt is persisted together with the resulting execution state
//! (`record_attempt`), conditional on the worker still owning the record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use stepline_types::execution::{
    AttemptOutcome, Execution, ExecutionStatus, StepAttempt, StepExecutionError,
};
use stepline_types::workflow::Step;
use uuid::Uuid;

use super::error::EngineError;
use super::retry::{RetryDecision, RetryPolicy};
use super::step_executor::StepExecutor;
use crate::repository::execution::ExecutionRepository;

/// Apply `next` to `execution` if the lifecycle allows it.
pub fn transition(execution: &mut Execution, next: ExecutionStatus) -> Result<(), EngineError> {
    if execution.status.is_terminal() {
        return Err(EngineError::ExecutionAlreadyTerminal {
            id: execution.id,
            status: execution.status,
        });
    }
    if !execution.status.can_transition_to(next) {
        return Err(EngineError::InvalidTransition {
            from: execution.status,
            to: next,
        });
    }
    execution.status = next;
    Ok(())
}

/// Where a claimed execution ended up after `drive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Failed,
    /// Parked until the backoff delay has elapsed.
    Retrying { delay: Duration },
}

/// Drives claimed executions through their steps.
pub struct ExecutionStateMachine<E: ExecutionRepository> {
    repo: Arc<E>,
    executor: Arc<StepExecutor>,
    policy: RetryPolicy,
    lease_renewal: Duration,
}

impl<E: ExecutionRepository> ExecutionStateMachine<E> {
    /// `lease_renewal` is how often the owner refreshes its lease while a
    /// step is in flight; keep it well below the liveness threshold.
    pub fn new(
        repo: Arc<E>,
        executor: Arc<StepExecutor>,
        policy: RetryPolicy,
        lease_renewal: Duration,
    ) -> Self {
        Self {
            repo,
            executor,
            policy,
            lease_renewal: lease_renewal.max(Duration::from_millis(10)),
        }
    }

    /// Run a claimed execution until it completes, fails, or is parked for
    /// retry. `execution` must be `Running` and owned by `worker`.
    pub async fn drive(
        &self,
        mut execution: Execution,
        worker: &str,
    ) -> Result<DriveOutcome, EngineError> {
        if execution.is_terminal() {
            return Err(EngineError::ExecutionAlreadyTerminal {
                id: execution.id,
                status: execution.status,
            });
        }
        if execution.status != ExecutionStatus::Running || execution.owner.as_deref() != Some(worker)
        {
            return Err(EngineError::OwnershipLost {
                id: execution.id,
                worker: worker.to_string(),
            });
        }

        loop {
            let index = execution.current_step_index;
            let Some(step) = execution.current_step().cloned() else {
                // Completion is written with the last attempt, so a running
                // execution always has a current step.
                return Err(EngineError::InvalidTransition {
                    from: execution.status,
                    to: ExecutionStatus::Completed,
                });
            };
            let attempt_number = execution.attempts_for(index) + 1;

            tracing::debug!(
                execution_id = %execution.id,
                step = %step.name,
                step_index = index,
                attempt = attempt_number,
                task_type = %step.task_type,
                "running step"
            );

            let started_at = Utc::now();
            let result = self.run_with_heartbeat(&execution.id, worker, &step).await?;
            let finished_at = Utc::now();

            let mut attempt = StepAttempt {
                id: Uuid::now_v7(),
                execution_id: execution.id,
                step_index: index,
                step_name: step.name.clone(),
                attempt: attempt_number,
                outcome: AttemptOutcome::Succeeded,
                error_kind: None,
                error: None,
                output: None,
                started_at,
                finished_at,
            };
            execution.updated_at = finished_at;

            let outcome = match result {
                Ok(value) => {
                    attempt.output = Some(value.clone());
                    execution.output.insert(step.name.clone(), value);
                    execution.current_step_index += 1;
                    execution.leased_at = Some(finished_at);

                    if execution.current_step().is_none() {
                        transition(&mut execution, ExecutionStatus::Completed)?;
                        execution.completed_at = Some(finished_at);
                        Some(DriveOutcome::Completed)
                    } else {
                        None
                    }
                }
                Err(err) => {
                    attempt.outcome = AttemptOutcome::Failed;
                    attempt.error_kind = Some(err.kind);
                    attempt.error = Some(err.detail.clone());
                    execution.attempt_counts.insert(index, attempt_number);

                    match self.policy.decide_for_step(&step, attempt_number, err.kind) {
                        RetryDecision::Retry { delay } => {
                            transition(&mut execution, ExecutionStatus::Retrying)?;
                            execution.next_attempt_at = Some(after(finished_at, delay));
                            execution.owner = None;
                            execution.leased_at = None;
                            tracing::info!(
                                execution_id = %execution.id,
                                step = %step.name,
                                attempt = attempt_number,
                                kind = %err.kind,
                                delay_ms = delay.as_millis() as u64,
                                "step failed, retry scheduled"
                            );
                            Some(DriveOutcome::Retrying { delay })
                        }
                        RetryDecision::Terminate => {
                            transition(&mut execution, ExecutionStatus::Failed)?;
                            execution.error = Some(format!(
                                "step '{}' failed after {} attempt(s): {}",
                                step.name, attempt_number, err
                            ));
                            execution.completed_at = Some(finished_at);
                            Some(DriveOutcome::Failed)
                        }
                    }
                }
            };

            if !self.repo.record_attempt(&execution, &attempt, worker).await? {
                return Err(EngineError::OwnershipLost {
                    id: execution.id,
                    worker: worker.to_string(),
                });
            }

            match outcome {
                Some(DriveOutcome::Completed) => {
                    tracing::info!(
                        execution_id = %execution.id,
                        steps = execution.current_step_index,
                        "execution completed"
                    );
                    return Ok(DriveOutcome::Completed);
                }
                Some(DriveOutcome::Failed) => {
                    tracing::info!(
                        execution_id = %execution.id,
                        error = execution.error.as_deref().unwrap_or_default(),
                        "execution failed"
                    );
                    return Ok(DriveOutcome::Failed);
                }
                Some(retrying) => return Ok(retrying),
                None => continue,
            }
        }
    }

    /// Run one step, renewing the lease until it returns. Losing the lease
    /// abandons the in-flight call. A failed renewal is retried on the next
    /// tick; the lease only goes stale after the liveness threshold.
    async fn run_with_heartbeat(
        &self,
        execution_id: &Uuid,
        worker: &str,
        step: &Step,
    ) -> Result<Result<Value, StepExecutionError>, EngineError> {
        let call = self.executor.execute_step(step);
        tokio::pin!(call);

        let mut heartbeat = tokio::time::interval(self.lease_renewal);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut call => return Ok(result),
                _ = heartbeat.tick() => {
                    match self.repo.renew_lease(execution_id, worker, Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(
                                execution_id = %execution_id,
                                worker = %worker,
                                "lease lost while step was running"
                            );
                            return Err(EngineError::OwnershipLost {
                                id: *execution_id,
                                worker: worker.to_string(),
                            });
                        }
                        Err(e) => {
                            tracing::warn!(
                                execution_id = %execution_id,
                                worker = %worker,
                                error = %e,
                                "lease renewal failed, retrying on next heartbeat"
                            );
                        }
                    }
                }
            }
        }
    }
}

fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(at)
}
