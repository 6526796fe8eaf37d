//! Execution engine.
//!
//! Drives executions of activated workflows to a terminal state:
//!
//! - `idempotency`: maps an idempotency key to exactly one execution.
//! - `queue`: hand-off of execution IDs from creation to workers.
//! - `worker`: pool of loops that claim executions and drive them.
//! - `state_machine`: lifecycle transitions and the per-step procedure.
//! - `step_executor`: dispatch of a step to its task handler, with timeout.
//! - `retry`: retry-or-terminate decision and backoff delay.
//! - `reconciler`: liveness sweep that re-enqueues stranded executions.
//! - `engine`: facade wiring the above together.

pub mod engine;
pub mod error;
pub mod idempotency;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod state_machine;
pub mod step_executor;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
