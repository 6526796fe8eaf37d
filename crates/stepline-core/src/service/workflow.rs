//! Workflow authoring service.
//!
//! Enforces the definition lifecycle: workflows are created in `Draft`, steps
//! are appended only while `Draft`, activation is one-way and requires at
//! least one step, and only `Active` workflows can be archived.
//!
//! The status checks here give early, descriptive errors. The repository
//! re-checks status atomically with each write, so a concurrent activation
//! cannot let a step land on an active workflow.

use stepline_types::error::{RepositoryError, WorkflowError};
use stepline_types::workflow::{NewStep, Step, Workflow, WorkflowStatus};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

/// Service owning workflow definition rules.
///
/// Generic over the repository so stepline-core never depends on
/// stepline-infra.
pub struct WorkflowService<W: WorkflowRepository> {
    repo: W,
}

impl<W: WorkflowRepository> WorkflowService<W> {
    pub fn new(repo: W) -> Self {
        Self { repo }
    }

    /// Create a new draft workflow with a unique, non-empty name.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Workflow, WorkflowError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(WorkflowError::InvalidName("name cannot be empty".to_string()));
        }

        let now = chrono::Utc::now();
        let workflow = Workflow {
            id: Uuid::now_v7(),
            name: name.clone(),
            description: description.filter(|d| !d.trim().is_empty()),
            status: WorkflowStatus::Draft,
            steps: vec![],
            created_at: now,
            updated_at: now,
        };

        self.repo
            .create_workflow(&workflow)
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => WorkflowError::NameConflict(name.clone()),
                other => WorkflowError::StorageError(other.to_string()),
            })?;

        tracing::info!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
        Ok(workflow)
    }

    /// Append a step to a draft workflow at the next free position.
    pub async fn add_step(&self, workflow_id: &Uuid, new_step: NewStep) -> Result<Step, WorkflowError> {
        let workflow = self.get(workflow_id).await?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(WorkflowError::NotDraft(workflow.status));
        }

        let name = new_step.name.trim().to_string();
        if name.is_empty() {
            return Err(WorkflowError::InvalidName(
                "step name cannot be empty".to_string(),
            ));
        }
        if workflow.steps.iter().any(|s| s.name == name) {
            return Err(WorkflowError::DuplicateStepName(name));
        }

        let step = Step {
            id: Uuid::now_v7(),
            workflow_id: workflow.id,
            name: name.clone(),
            task_type: new_step.task_type,
            position: workflow.steps.len() as u32,
            config: new_step.config,
            timeout_secs: new_step.timeout_secs,
            max_attempts: new_step.max_attempts,
        };

        self.repo.append_step(&step).await.map_err(|e| match e {
            RepositoryError::Conflict(_) => WorkflowError::DuplicateStepName(name),
            RepositoryError::NotFound => WorkflowError::NotFound(*workflow_id),
            RepositoryError::UnexpectedStatus(status) => WorkflowError::NotDraft(status),
            other => WorkflowError::StorageError(other.to_string()),
        })?;

        tracing::debug!(
            workflow_id = %workflow.id,
            step = %step.name,
            position = step.position,
            task_type = %step.task_type,
            "step appended"
        );
        Ok(step)
    }

    /// Freeze a draft workflow so executions can be created against it.
    pub async fn activate(&self, workflow_id: &Uuid) -> Result<Workflow, WorkflowError> {
        let workflow = self.get(workflow_id).await?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(WorkflowError::InvalidStatusChange {
                from: workflow.status,
                to: WorkflowStatus::Active,
            });
        }
        if workflow.steps.is_empty() {
            return Err(WorkflowError::EmptyWorkflow);
        }

        self.set_status(workflow_id, WorkflowStatus::Draft, WorkflowStatus::Active)
            .await?;
        // Steps are frozen from here on; re-read so the result carries them all.
        let workflow = self.get(workflow_id).await?;
        tracing::info!(workflow_id = %workflow.id, steps = workflow.steps.len(), "workflow activated");
        Ok(workflow)
    }

    /// Retire an active workflow. In-flight executions keep running from
    /// their snapshots; new executions are refused.
    pub async fn archive(&self, workflow_id: &Uuid) -> Result<Workflow, WorkflowError> {
        let mut workflow = self.get(workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Err(WorkflowError::InvalidStatusChange {
                from: workflow.status,
                to: WorkflowStatus::Archived,
            });
        }

        self.set_status(workflow_id, WorkflowStatus::Active, WorkflowStatus::Archived)
            .await?;
        workflow.status = WorkflowStatus::Archived;
        tracing::info!(workflow_id = %workflow.id, "workflow archived");
        Ok(workflow)
    }

    /// Get a workflow by ID.
    pub async fn get(&self, workflow_id: &Uuid) -> Result<Workflow, WorkflowError> {
        self.repo
            .get_workflow(workflow_id)
            .await
            .map_err(|e| WorkflowError::StorageError(e.to_string()))?
            .ok_or(WorkflowError::NotFound(*workflow_id))
    }

    /// Get a workflow by name. `Ok(None)` when no workflow has that name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Workflow>, WorkflowError> {
        self.repo
            .get_workflow_by_name(name)
            .await
            .map_err(|e| WorkflowError::StorageError(e.to_string()))
    }

    /// Resolve a workflow by UUID or by name.
    pub async fn resolve(&self, id_or_name: &str) -> Result<Option<Workflow>, WorkflowError> {
        if let Ok(id) = Uuid::parse_str(id_or_name) {
            if let Some(workflow) = self
                .repo
                .get_workflow(&id)
                .await
                .map_err(|e| WorkflowError::StorageError(e.to_string()))?
            {
                return Ok(Some(workflow));
            }
        }
        self.get_by_name(id_or_name).await
    }

    pub async fn list(&self) -> Result<Vec<Workflow>, WorkflowError> {
        self.repo
            .list_workflows()
            .await
            .map_err(|e| WorkflowError::StorageError(e.to_string()))
    }

    async fn set_status(
        &self,
        workflow_id: &Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<(), WorkflowError> {
        self.repo
            .update_workflow_status(workflow_id, from, to)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => WorkflowError::NotFound(*workflow_id),
                RepositoryError::UnexpectedStatus(current) => {
                    WorkflowError::InvalidStatusChange { from: current, to }
                }
                other => WorkflowError::StorageError(other.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRepository;
    use serde_json::json;
    use stepline_types::workflow::TaskType;

    fn service() -> WorkflowService<InMemoryRepository> {
        WorkflowService::new(InMemoryRepository::new())
    }

    fn new_step(name: &str) -> NewStep {
        NewStep {
            name: name.to_string(),
            task_type: TaskType::HttpRequest,
            config: json!({"url": "http://localhost:8080/"}),
            timeout_secs: None,
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn test_create_workflow_starts_as_draft() {
        let svc = service();
        let wf = svc
            .create_workflow("  nightly-export ", Some("exports".to_string()))
            .await
            .unwrap();
        assert_eq!(wf.name, "nightly-export");
        assert_eq!(wf.status, WorkflowStatus::Draft);
        assert!(wf.steps.is_empty());
    }

    #[tokio::test]
    async fn test_create_workflow_rejects_empty_and_duplicate_names() {
        let svc = service();
        assert!(matches!(
            svc.create_workflow("   ", None).await,
            Err(WorkflowError::InvalidName(_))
        ));

        svc.create_workflow("sync", None).await.unwrap();
        assert!(matches!(
            svc.create_workflow("sync", None).await,
            Err(WorkflowError::NameConflict(name)) if name == "sync"
        ));
    }

    #[tokio::test]
    async fn test_add_step_assigns_dense_positions() {
        let svc = service();
        let wf = svc.create_workflow("etl", None).await.unwrap();
        let a = svc.add_step(&wf.id, new_step("extract")).await.unwrap();
        let b = svc.add_step(&wf.id, new_step("transform")).await.unwrap();
        let c = svc.add_step(&wf.id, new_step("load")).await.unwrap();
        assert_eq!((a.position, b.position, c.position), (0, 1, 2));

        let stored = svc.get(&wf.id).await.unwrap();
        let names: Vec<_> = stored.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["extract", "transform", "load"]);
    }

    #[tokio::test]
    async fn test_add_step_rejects_duplicate_step_name() {
        let svc = service();
        let wf = svc.create_workflow("etl", None).await.unwrap();
        svc.add_step(&wf.id, new_step("extract")).await.unwrap();
        assert!(matches!(
            svc.add_step(&wf.id, new_step("extract")).await,
            Err(WorkflowError::DuplicateStepName(_))
        ));
    }

    #[tokio::test]
    async fn test_steps_frozen_after_activation() {
        let svc = service();
        let wf = svc.create_workflow("etl", None).await.unwrap();
        svc.add_step(&wf.id, new_step("extract")).await.unwrap();
        let active = svc.activate(&wf.id).await.unwrap();
        assert_eq!(active.status, WorkflowStatus::Active);

        assert!(matches!(
            svc.add_step(&wf.id, new_step("load")).await,
            Err(WorkflowError::NotDraft(WorkflowStatus::Active))
        ));
    }

    /// Delays `append_step` so an activation can land between the draft
    /// check in `add_step` and the write.
    #[derive(Clone)]
    struct SlowAppend {
        inner: InMemoryRepository,
        delay: std::time::Duration,
    }

    impl WorkflowRepository for SlowAppend {
        async fn create_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
            self.inner.create_workflow(workflow).await
        }

        async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
            self.inner.get_workflow(id).await
        }

        async fn get_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
            self.inner.get_workflow_by_name(name).await
        }

        async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
            self.inner.list_workflows().await
        }

        async fn append_step(&self, step: &Step) -> Result<(), RepositoryError> {
            tokio::time::sleep(self.delay).await;
            self.inner.append_step(step).await
        }

        async fn update_workflow_status(
            &self,
            id: &Uuid,
            from: WorkflowStatus,
            to: WorkflowStatus,
        ) -> Result<(), RepositoryError> {
            self.inner.update_workflow_status(id, from, to).await
        }
    }

    #[tokio::test]
    async fn test_add_step_racing_activation_is_rejected() {
        let repo = InMemoryRepository::new();
        let svc = WorkflowService::new(repo.clone());
        let wf = svc.create_workflow("etl", None).await.unwrap();
        svc.add_step(&wf.id, new_step("extract")).await.unwrap();

        let slow = std::sync::Arc::new(WorkflowService::new(SlowAppend {
            inner: repo.clone(),
            delay: std::time::Duration::from_millis(100),
        }));
        let late = tokio::spawn({
            let slow = slow.clone();
            let id = wf.id;
            async move { slow.add_step(&id, new_step("late")).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let active = svc.activate(&wf.id).await.unwrap();
        assert_eq!(active.steps.len(), 1);

        assert!(matches!(
            late.await.unwrap(),
            Err(WorkflowError::NotDraft(WorkflowStatus::Active))
        ));
        let stored = svc.get(&wf.id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Active);
        assert_eq!(stored.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_status_transition_is_rejected() {
        let repo = InMemoryRepository::new();
        let svc = WorkflowService::new(repo.clone());
        let wf = svc.create_workflow("etl", None).await.unwrap();
        svc.add_step(&wf.id, new_step("extract")).await.unwrap();
        svc.activate(&wf.id).await.unwrap();

        // A second caller that still believes the workflow is a draft.
        let err = svc
            .set_status(&wf.id, WorkflowStatus::Draft, WorkflowStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidStatusChange {
                from: WorkflowStatus::Active,
                to: WorkflowStatus::Active,
            }
        ));
    }

    #[tokio::test]
    async fn test_activate_requires_steps() {
        let svc = service();
        let wf = svc.create_workflow("empty", None).await.unwrap();
        assert!(matches!(
            svc.activate(&wf.id).await,
            Err(WorkflowError::EmptyWorkflow)
        ));
    }

    #[tokio::test]
    async fn test_activation_is_one_way() {
        let svc = service();
        let wf = svc.create_workflow("etl", None).await.unwrap();
        svc.add_step(&wf.id, new_step("extract")).await.unwrap();
        svc.activate(&wf.id).await.unwrap();

        assert!(matches!(
            svc.activate(&wf.id).await,
            Err(WorkflowError::InvalidStatusChange { .. })
        ));

        svc.archive(&wf.id).await.unwrap();
        assert!(matches!(
            svc.archive(&wf.id).await,
            Err(WorkflowError::InvalidStatusChange { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_by_id_or_name() {
        let svc = service();
        let wf = svc.create_workflow("billing", None).await.unwrap();
        assert_eq!(svc.resolve("billing").await.unwrap().unwrap().id, wf.id);
        assert_eq!(
            svc.resolve(&wf.id.to_string()).await.unwrap().unwrap().name,
            "billing"
        );
        assert!(svc.resolve("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_missing_workflow() {
        let svc = service();
        let id = Uuid::now_v7();
        assert!(matches!(svc.get(&id).await, Err(WorkflowError::NotFound(got)) if got == id));
    }
}
