//! Worker pool.
//!
//! Each worker loop suspends on the dispatch queue, claims the execution it
//! receives, and drives it to a terminal state or to a `Retrying` park. A
//! parked execution is handed back to the queue with its backoff delay; the
//! worker moves on to other work meanwhile. A reconciler task runs alongside
//! the workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use stepline_types::config::{ReconcilerConfig, WorkerConfig};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::error::EngineError;
use super::queue::DispatchQueue;
use super::reconciler::Reconciler;
use super::state_machine::{DriveOutcome, ExecutionStateMachine};
use crate::repository::execution::ExecutionRepository;

/// Pause after a queue error before dequeuing again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A fixed-size pool of worker loops plus the reconciler.
pub struct WorkerPool<E: ExecutionRepository, Q: DispatchQueue> {
    repo: Arc<E>,
    queue: Arc<Q>,
    machine: Arc<ExecutionStateMachine<E>>,
    worker: WorkerConfig,
    reconciler: ReconcilerConfig,
}

impl<E, Q> WorkerPool<E, Q>
where
    E: ExecutionRepository + 'static,
    Q: DispatchQueue + 'static,
{
    pub fn new(
        repo: Arc<E>,
        queue: Arc<Q>,
        machine: Arc<ExecutionStateMachine<E>>,
        worker: WorkerConfig,
        reconciler: ReconcilerConfig,
    ) -> Self {
        Self {
            repo,
            queue,
            machine,
            worker,
            reconciler,
        }
    }

    /// Spawn the workers and the reconciler.
    pub fn start(&self) -> WorkerPoolHandle {
        let cancel = CancellationToken::new();
        let pool_id = pool_id();
        let mut tasks = JoinSet::new();

        let concurrency = self.worker.concurrency.max(1);
        for n in 0..concurrency {
            let worker = Worker {
                id: format!("{pool_id}/w{n}"),
                repo: self.repo.clone(),
                queue: self.queue.clone(),
                machine: self.machine.clone(),
                liveness_threshold: self.reconciler.liveness_threshold(),
            };
            tasks.spawn(worker.run(cancel.child_token()));
        }

        let reconciler = Reconciler::new(
            self.repo.clone(),
            self.queue.clone(),
            self.reconciler.clone(),
        );
        tasks.spawn(reconciler.run(cancel.child_token()));

        tracing::info!(pool = %pool_id, workers = concurrency, "worker pool started");
        WorkerPoolHandle {
            pool_id,
            workers: concurrency,
            cancel,
            tasks,
        }
    }
}

/// Control handle for a running pool.
pub struct WorkerPoolHandle {
    pool_id: String,
    workers: usize,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl WorkerPoolHandle {
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop dequeuing and wait for in-flight executions to reach their next
    /// persisted state.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(pool = %self.pool_id, error = %e, "worker task panicked");
            }
        }
        tracing::info!(pool = %self.pool_id, "worker pool stopped");
    }
}

struct Worker<E: ExecutionRepository, Q: DispatchQueue> {
    id: String,
    repo: Arc<E>,
    queue: Arc<Q>,
    machine: Arc<ExecutionStateMachine<E>>,
    liveness_threshold: Duration,
}

impl<E: ExecutionRepository, Q: DispatchQueue> Worker<E, Q> {
    async fn run(self, cancel: CancellationToken) {
        tracing::debug!(worker = %self.id, "worker started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue() => next,
            };

            match next {
                Ok(Some(execution_id)) => {
                    let span = tracing::info_span!(
                        "execution",
                        execution_id = %execution_id,
                        worker = %self.id
                    );
                    self.process(execution_id).instrument(span).await;
                }
                Ok(None) => {
                    tracing::info!(worker = %self.id, "dispatch queue closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::debug!(worker = %self.id, "worker stopped");
    }

    async fn process(&self, execution_id: Uuid) {
        let now = Utc::now();
        let threshold = TimeDelta::from_std(self.liveness_threshold).unwrap_or(TimeDelta::MAX);
        let stale_before = now.checked_sub_signed(threshold).unwrap_or(now);

        let execution = match self
            .repo
            .claim_execution(&execution_id, &self.id, now, stale_before)
            .await
        {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                tracing::debug!("execution not claimable, skipping delivery");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to claim execution");
                return;
            }
        };

        tracing::info!(
            step_index = execution.current_step_index,
            steps = execution.workflow.steps.len(),
            "execution claimed"
        );

        match self.machine.drive(execution, &self.id).await {
            Ok(DriveOutcome::Retrying { delay }) => {
                if let Err(e) = self.queue.enqueue_after(execution_id, delay).await {
                    tracing::warn!(
                        error = %e,
                        "failed to schedule retry, leaving it to the reconciler"
                    );
                }
            }
            Ok(DriveOutcome::Completed | DriveOutcome::Failed) => {}
            Err(EngineError::OwnershipLost { .. }) => {
                tracing::warn!("lost ownership mid-execution, another worker has taken over");
            }
            Err(e) => {
                tracing::error!(error = %e, "execution stopped on unexpected error");
            }
        }
    }
}

fn pool_id() -> String {
    let id = Uuid::now_v7().simple().to_string();
    // The tail of a v7 UUID is random; the head is a timestamp.
    format!("pool-{}", &id[id.len() - 8..])
}
