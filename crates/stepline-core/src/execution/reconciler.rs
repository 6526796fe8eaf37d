//! Liveness sweep.
//!
//! Re-enqueues executions that no worker is going to touch on its own:
//! `Pending` ones older than the liveness threshold (lost hand-off),
//! `Running` ones whose lease has gone stale (crashed worker), and
//! `Retrying` ones that are due (lost delayed enqueue). Duplicate deliveries
//! are filtered by `claim_execution`, so over-enqueuing is safe.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use stepline_types::config::ReconcilerConfig;
use tokio_util::sync::CancellationToken;

use super::error::EngineError;
use super::queue::DispatchQueue;
use crate::repository::execution::{ExecutionRepository, RecoveryQuery};

pub struct Reconciler<E: ExecutionRepository, Q: DispatchQueue> {
    repo: Arc<E>,
    queue: Arc<Q>,
    config: ReconcilerConfig,
}

impl<E: ExecutionRepository, Q: DispatchQueue> Reconciler<E, Q> {
    pub fn new(repo: Arc<E>, queue: Arc<Q>, config: ReconcilerConfig) -> Self {
        Self { repo, queue, config }
    }

    /// Run one sweep and return how many executions were re-enqueued.
    ///
    /// With `include_fresh_pending`, every `Pending` execution is
    /// re-enqueued regardless of age. Used at start-up, when a process-local
    /// queue has lost everything it held.
    pub async fn sweep(&self, include_fresh_pending: bool) -> Result<usize, EngineError> {
        let now = Utc::now();
        let threshold = TimeDelta::from_std(self.config.liveness_threshold())
            .unwrap_or(TimeDelta::seconds(120));
        let stale_before = now - threshold;

        let query = RecoveryQuery {
            pending_before: if include_fresh_pending { now } else { stale_before },
            lease_before: stale_before,
            due_by: now,
            limit: self.config.batch_size.max(1),
        };

        let ids = self.repo.list_recoverable(&query).await?;
        let mut enqueued = 0;
        for id in &ids {
            match self.queue.enqueue(*id).await {
                Ok(()) => enqueued += 1,
                Err(e) => {
                    tracing::warn!(execution_id = %id, error = %e, "reconciler failed to enqueue");
                }
            }
        }

        if enqueued > 0 {
            tracing::info!(count = enqueued, "reconciler re-enqueued executions");
        } else {
            tracing::debug!("reconciler found nothing to recover");
        }
        Ok(enqueued)
    }

    /// Sweep once immediately, then every `interval_secs` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        if let Err(e) = self.sweep(true).await {
            tracing::error!(error = %e, "start-up reconciliation failed");
        }

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(false).await {
                        tracing::error!(error = %e, "reconciliation sweep failed");
                    }
                }
            }
        }
        tracing::debug!("reconciler stopped");
    }
}
