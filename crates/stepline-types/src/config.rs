//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the stepline data directory.
//! Every field has a default, so an empty file (or no file) is a valid config.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::FailureKind;

/// Top-level configuration for the execution engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl EngineConfig {
    /// Reject combinations the engine cannot run safely.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.executor.step_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "executor.step_timeout_secs must be at least 1".to_string(),
            ));
        }
        // A lease shorter than a step could be stolen from a healthy worker.
        if self.reconciler.liveness_threshold_secs <= self.executor.step_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "reconciler.liveness_threshold_secs ({}) must exceed executor.step_timeout_secs ({})",
                self.reconciler.liveness_threshold_secs, self.executor.step_timeout_secs
            )));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// How the backoff delay grows with the attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * attempts`
    Linear,
    /// `base * 2^(attempts - 1)`
    Exponential,
}

/// Default retry policy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per step, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Failure kinds that terminate the execution on first occurrence.
    #[serde(default = "default_non_retryable")]
    pub non_retryable: Vec<FailureKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_non_retryable() -> Vec<FailureKind> {
    vec![FailureKind::ConfigurationError]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            non_retryable: default_non_retryable(),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker / executor / reconciler
// ---------------------------------------------------------------------------

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker loops consuming the dispatch queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Poll interval for queues that have to poll (SQLite).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Step executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default execution time bound per step invocation.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    30
}

impl ExecutorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

/// Liveness sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between sweeps.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Age after which a pending execution or a running lease counts as stranded.
    #[serde(default = "default_liveness_threshold_secs")]
    pub liveness_threshold_secs: u64,
    /// Maximum executions re-enqueued per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_interval_secs() -> u64 {
    15
}

fn default_liveness_threshold_secs() -> u64 {
    120
}

fn default_batch_size() -> u32 {
    100
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            liveness_threshold_secs: default_liveness_threshold_secs(),
            batch_size: default_batch_size(),
        }
    }
}

/// Settings for the `http_request` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_user_agent() -> String {
    "stepline/0.1".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}
