//! Idempotency guard: maps each idempotency key to at most one execution.
//!
//! Creation relies on the repository's atomic `insert_if_absent`; the
//! pre-check by key only short-circuits the common replay case. Of several
//! concurrent callers with one key, exactly one inserts and enqueues; the
//! others receive the winner's record.

use std::sync::Arc;

use stepline_types::execution::Execution;
use stepline_types::workflow::WorkflowSnapshot;
use uuid::Uuid;

use super::error::EngineError;
use super::queue::DispatchQueue;
use crate::repository::execution::ExecutionRepository;
use crate::repository::workflow::WorkflowRepository;

/// Longest accepted idempotency key, in bytes.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

pub struct IdempotencyGuard<W, E, Q>
where
    W: WorkflowRepository,
    E: ExecutionRepository,
    Q: DispatchQueue,
{
    workflows: Arc<W>,
    executions: Arc<E>,
    queue: Arc<Q>,
}

impl<W, E, Q> IdempotencyGuard<W, E, Q>
where
    W: WorkflowRepository,
    E: ExecutionRepository,
    Q: DispatchQueue,
{
    pub fn new(workflows: Arc<W>, executions: Arc<E>, queue: Arc<Q>) -> Self {
        Self {
            workflows,
            executions,
            queue,
        }
    }

    /// Return the execution for `idempotency_key`, creating and enqueuing a
    /// new `Pending` one against `workflow_id` if none exists.
    pub async fn create_execution(
        &self,
        workflow_id: &Uuid,
        idempotency_key: &str,
    ) -> Result<Execution, EngineError> {
        let key = validate_key(idempotency_key)?;

        if let Some(existing) = self.executions.get_execution_by_key(key).await? {
            return Ok(self.replayed(existing, workflow_id));
        }

        let workflow = self
            .workflows
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(*workflow_id))?;
        if !workflow.is_runnable() {
            return Err(EngineError::WorkflowNotActive {
                id: workflow.id,
                status: workflow.status,
                steps: workflow.steps.len(),
            });
        }

        let candidate = Execution::new(WorkflowSnapshot::from(&workflow), key);
        let (execution, created) = self.executions.insert_if_absent(&candidate).await?;
        if !created {
            return Ok(self.replayed(execution, workflow_id));
        }

        tracing::info!(
            execution_id = %execution.id,
            workflow = %workflow.name,
            idempotency_key = key,
            "execution created"
        );

        // The record is durable; if the hand-off fails the reconciler picks
        // the execution up once it is older than the liveness threshold.
        if let Err(e) = self.queue.enqueue(execution.id).await {
            tracing::warn!(
                execution_id = %execution.id,
                error = %e,
                "failed to enqueue new execution, leaving it to the reconciler"
            );
        }

        Ok(execution)
    }

    fn replayed(&self, existing: Execution, workflow_id: &Uuid) -> Execution {
        if &existing.workflow.workflow_id != workflow_id {
            tracing::warn!(
                execution_id = %existing.id,
                idempotency_key = %existing.idempotency_key,
                requested_workflow = %workflow_id,
                existing_workflow = %existing.workflow.workflow_id,
                "idempotency key reused for a different workflow, returning existing execution"
            );
        } else {
            tracing::debug!(
                execution_id = %existing.id,
                status = %existing.status,
                "idempotency key replayed"
            );
        }
        existing
    }
}

fn validate_key(key: &str) -> Result<&str, EngineError> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidIdempotencyKey(
            "key cannot be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(EngineError::InvalidIdempotencyKey(format!(
            "key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::queue::InMemoryDispatchQueue;
    use crate::execution::test_support::activate_workflow;
    use crate::repository::memory::InMemoryRepository;
    use crate::service::workflow::WorkflowService;
    use std::time::Duration;
    use stepline_types::execution::ExecutionStatus;

    type Guard = IdempotencyGuard<InMemoryRepository, InMemoryRepository, InMemoryDispatchQueue>;

    fn guard(repo: &InMemoryRepository, queue: &InMemoryDispatchQueue) -> Guard {
        IdempotencyGuard::new(
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            Arc::new(queue.clone()),
        )
    }

    #[tokio::test]
    async fn test_creates_pending_execution_and_enqueues_once() {
        let repo = InMemoryRepository::new();
        let queue = InMemoryDispatchQueue::new();
        let wf = activate_workflow(&repo, "wf", &[("a", "noop")]).await;
        let guard = guard(&repo, &queue);

        let first = guard.create_execution(&wf.id, "order-7").await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Pending);
        assert_eq!(first.workflow.steps.len(), 1);

        let again = guard.create_execution(&wf.id, "order-7").await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(repo.execution_count().await, 1);

        assert_eq!(queue.dequeue().await.unwrap(), Some(first.id));
        let nothing = tokio::time::timeout(Duration::from_millis(50), queue.dequeue()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_same_key_yields_one_execution() {
        let repo = InMemoryRepository::new();
        let queue = InMemoryDispatchQueue::new();
        let wf = activate_workflow(&repo, "wf", &[("a", "noop")]).await;
        let guard = Arc::new(guard(&repo, &queue));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            let wf_id = wf.id;
            handles.push(tokio::spawn(async move {
                guard.create_execution(&wf_id, "same-key").await.unwrap().id
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(repo.execution_count().await, 1);
    }

    #[tokio::test]
    async fn test_draft_workflow_is_not_active() {
        let repo = InMemoryRepository::new();
        let queue = InMemoryDispatchQueue::new();
        let service = WorkflowService::new(repo.clone());
        let wf = service.create_workflow("draft", None).await.unwrap();

        let err = guard(&repo, &queue)
            .create_execution(&wf.id, "k")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotActive { .. }));
        assert_eq!(repo.execution_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_workflow() {
        let repo = InMemoryRepository::new();
        let queue = InMemoryDispatchQueue::new();
        let id = Uuid::now_v7();
        let err = guard(&repo, &queue).create_execution(&id, "k").await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(got) if got == id));
    }

    #[tokio::test]
    async fn test_archived_workflow_rejects_new_but_replays_existing() {
        let repo = InMemoryRepository::new();
        let queue = InMemoryDispatchQueue::new();
        let wf = activate_workflow(&repo, "wf", &[("a", "noop")]).await;
        let guard = guard(&repo, &queue);
        let existing = guard.create_execution(&wf.id, "before").await.unwrap();

        WorkflowService::new(repo.clone()).archive(&wf.id).await.unwrap();

        assert!(matches!(
            guard.create_execution(&wf.id, "after").await,
            Err(EngineError::WorkflowNotActive { .. })
        ));
        assert_eq!(
            guard.create_execution(&wf.id, "before").await.unwrap().id,
            existing.id
        );
    }

    #[tokio::test]
    async fn test_rejects_blank_key() {
        let repo = InMemoryRepository::new();
        let queue = InMemoryDispatchQueue::new();
        let wf = activate_workflow(&repo, "wf", &[("a", "noop")]).await;
        assert!(matches!(
            guard(&repo, &queue).create_execution(&wf.id, "  ").await,
            Err(EngineError::InvalidIdempotencyKey(_))
        ));
    }
}
