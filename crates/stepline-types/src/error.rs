use thiserror::Error;
use uuid::Uuid;

use crate::workflow::WorkflowStatus;

/// Errors from repository operations (used by trait definitions in stepline-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// A status-guarded write found the workflow in another status.
    #[error("workflow is {0}")]
    UnexpectedStatus(WorkflowStatus),
}

/// Errors related to workflow authoring.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    #[error("workflow name '{0}' already exists")]
    NameConflict(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("workflow is {0}, steps can only be added while draft")]
    NotDraft(WorkflowStatus),

    #[error("step name '{0}' already used in this workflow")]
    DuplicateStepName(String),

    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("cannot move workflow from {from} to {to}")]
    InvalidStatusChange {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("storage error: {0}")]
    StorageError(String),
}
