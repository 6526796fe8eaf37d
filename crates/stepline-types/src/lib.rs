//! Shared domain types for stepline.
//!
//! Workflow definitions, execution records, the step-attempt audit log,
//! engine configuration, and the error enums shared by every layer.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod execution;
pub mod workflow;
