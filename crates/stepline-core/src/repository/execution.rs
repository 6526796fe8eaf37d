//! Execution repository trait definition.
//!
//! Storage for executions and their step-attempt audit log. The engine's
//! correctness rests on three atomic operations provided here:
//!
//! - `insert_if_absent` resolves concurrent creations for one idempotency key.
//! - `claim_execution` is the sole ownership acquisition (conditional update).
//! - `record_attempt` appends the audit row and persists the execution's new
//!   state together, and only for the worker holding the lease.

use chrono::{DateTime, Utc};
use stepline_types::error::RepositoryError;
use stepline_types::execution::{Execution, StepAttempt};
use uuid::Uuid;

/// Cut-off times for the liveness sweep.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryQuery {
    /// `Pending` executions created before this are considered stranded.
    pub pending_before: DateTime<Utc>,
    /// `Running` executions whose lease is older than this are considered abandoned.
    pub lease_before: DateTime<Utc>,
    /// `Retrying` executions due at or before this are ready to run again.
    pub due_by: DateTime<Utc>,
    pub limit: u32,
}

/// Repository trait for execution persistence.
pub trait ExecutionRepository: Send + Sync {
    /// Insert `execution` unless one with the same idempotency key exists.
    ///
    /// Returns the stored execution and `true` when this call created it, or
    /// the pre-existing execution and `false`. Must be atomic with respect
    /// to concurrent calls for the same key.
    fn insert_if_absent(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(Execution, bool), RepositoryError>> + Send;

    fn get_execution(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    fn get_execution_by_key(
        &self,
        idempotency_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Atomically take ownership of an execution and mark it `Running`.
    ///
    /// Succeeds only when the execution is `Pending`, `Retrying` with
    /// `next_attempt_at <= now`, or `Running` with `leased_at < stale_before`.
    /// On success sets `owner`, `leased_at = now`, clears `next_attempt_at`,
    /// sets `started_at` if unset, and returns the updated record. Returns
    /// `None` when another worker holds it, it is terminal, not yet due, or
    /// does not exist.
    fn claim_execution(
        &self,
        id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Refresh `leased_at` for a running execution owned by `worker`.
    ///
    /// Returns `false` if the worker no longer holds the lease.
    fn renew_lease(
        &self,
        id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Append `attempt` and persist `execution`'s state in one transaction.
    ///
    /// Applies only while the stored record is owned by `worker` and not
    /// terminal; otherwise nothing is written and `false` is returned.
    fn record_attempt(
        &self,
        execution: &Execution,
        attempt: &StepAttempt,
        worker: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Audit log for an execution in the order attempts were recorded.
    fn list_attempts(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepAttempt>, RepositoryError>> + Send;

    /// Most recent executions, newest first, optionally for one workflow.
    fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// IDs of executions the liveness sweep should re-enqueue.
    fn list_recoverable(
        &self,
        query: &RecoveryQuery,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;
}
