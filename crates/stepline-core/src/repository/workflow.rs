//! Workflow repository trait definition.
//!
//! Storage for workflow definitions and their steps. Uniqueness of workflow
//! names, of `(workflow, position)` and of `(workflow, step name)` is
//! enforced by the implementation and reported as `RepositoryError::Conflict`.
//! Status-guarded writes check the workflow's status in the same atomic
//! operation as the write and report `RepositoryError::UnexpectedStatus`.

use stepline_types::error::RepositoryError;
use stepline_types::workflow::{Step, Workflow, WorkflowStatus};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    /// Insert a new workflow (without steps).
    fn create_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow with its steps ordered by position.
    fn get_workflow(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// Get a workflow by its unique name.
    fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List all workflows ordered by name.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Append a step to its workflow, only while the workflow is `Draft`.
    ///
    /// `NotFound` if the workflow does not exist, `UnexpectedStatus` with the
    /// current status if it is no longer a draft.
    fn append_step(
        &self,
        step: &Step,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move a workflow from `from` to `to`.
    ///
    /// `NotFound` if the workflow does not exist, `UnexpectedStatus` with the
    /// current status if it is not `from`.
    fn update_workflow_status(
        &self,
        id: &Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
