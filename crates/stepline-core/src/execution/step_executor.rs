//! Step executor: dispatches a step to the handler registered for its task
//! type and bounds every invocation with a timeout.
//!
//! Handlers implement [`TaskHandler`] (RPITIT). Because RPITIT traits are not
//! object-safe, the registry stores them as [`TaskHandlerDyn`] trait objects
//! via a blanket impl with boxed futures. Adding a task type means
//! registering a handler; nothing else in the engine changes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepline_types::execution::StepExecutionError;
use stepline_types::workflow::{Step, TaskType};

/// Executes one task type's configuration.
pub trait TaskHandler: Send + Sync {
    /// Run the task described by `config` and return its result payload.
    fn execute(
        &self,
        config: &Value,
    ) -> impl Future<Output = Result<Value, StepExecutionError>> + Send;
}

/// Object-safe version of [`TaskHandler`] with boxed futures.
pub trait TaskHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        config: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepExecutionError>> + Send + 'a>>;
}

impl<T: TaskHandler> TaskHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        config: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepExecutionError>> + Send + 'a>> {
        Box::pin(self.execute(config))
    }
}

/// Registry of task handlers keyed by task type.
pub struct StepExecutor {
    handlers: HashMap<TaskType, Arc<dyn TaskHandlerDyn>>,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            default_timeout,
        }
    }

    /// Register (or replace) the handler for a task type.
    pub fn register<H: TaskHandler + 'static>(
        &mut self,
        task_type: impl Into<TaskType>,
        handler: H,
    ) -> &mut Self {
        self.handlers.insert(task_type.into(), Arc::new(handler));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler<H: TaskHandler + 'static>(
        mut self,
        task_type: impl Into<TaskType>,
        handler: H,
    ) -> Self {
        self.register(task_type, handler);
        self
    }

    pub fn supports(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Execute a task with the default timeout.
    pub async fn execute(
        &self,
        task_type: &TaskType,
        config: &Value,
    ) -> Result<Value, StepExecutionError> {
        self.execute_with_timeout(task_type, config, self.default_timeout)
            .await
    }

    /// Execute a step, honoring its `timeout_secs` override.
    pub async fn execute_step(&self, step: &Step) -> Result<Value, StepExecutionError> {
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        self.execute_with_timeout(&step.task_type, &step.config, timeout)
            .await
    }

    async fn execute_with_timeout(
        &self,
        task_type: &TaskType,
        config: &Value,
        timeout: Duration,
    ) -> Result<Value, StepExecutionError> {
        let handler = self.handlers.get(task_type).ok_or_else(|| {
            StepExecutionError::configuration(format!("unknown task type '{task_type}'"))
        })?;

        match tokio::time::timeout(timeout, handler.execute_boxed(config)).await {
            Ok(result) => result,
            Err(_) => Err(StepExecutionError::timeout(format!(
                "task '{task_type}' did not finish within {}s",
                timeout.as_secs_f64()
            ))),
        }
    }
}
