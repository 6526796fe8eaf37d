//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepline-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides an implementation for
//! embedding and tests.

pub mod execution;
pub mod memory;
pub mod workflow;
