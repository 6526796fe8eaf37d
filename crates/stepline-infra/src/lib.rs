//! Infrastructure layer for stepline.
//!
//! Implementations of the ports defined in `stepline-core`: SQLite
//! repositories and dispatch queue, the `http_request` task handler, and
//! configuration loading.

pub mod config;
pub mod sqlite;
pub mod task;
