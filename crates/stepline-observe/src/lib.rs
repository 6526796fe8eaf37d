//! Observability setup for stepline binaries.

pub mod tracing_setup;
