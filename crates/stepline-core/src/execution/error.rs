//! Engine error taxonomy.

use stepline_types::error::RepositoryError;
use stepline_types::execution::ExecutionStatus;
use stepline_types::workflow::WorkflowStatus;
use uuid::Uuid;

/// Errors surfaced by the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// The workflow is not `Active` or has no steps. No execution is created.
    #[error("workflow {id} is not active (status: {status}, steps: {steps})")]
    WorkflowNotActive {
        id: Uuid,
        status: WorkflowStatus,
        steps: usize,
    },

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {id} is already {status}")]
    ExecutionAlreadyTerminal { id: Uuid, status: ExecutionStatus },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// The worker's lease was taken over or the record became terminal.
    #[error("worker {worker} no longer owns execution {id}")]
    OwnershipLost { id: Uuid, worker: String },

    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}
