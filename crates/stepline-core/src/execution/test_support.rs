//! Shared fixtures for engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use stepline_types::execution::StepExecutionError;
use stepline_types::workflow::{NewStep, Workflow};

use super::step_executor::TaskHandler;
use crate::repository::memory::InMemoryRepository;
use crate::service::workflow::WorkflowService;

/// Task handler that replays a script of results, repeating the last one.
#[derive(Clone)]
pub(crate) struct Scripted {
    script: Arc<Vec<Result<Value, StepExecutionError>>>,
    calls: Arc<AtomicU32>,
    delay: Duration,
}

impl Scripted {
    pub(crate) fn new(script: Vec<Result<Value, StepExecutionError>>) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicU32::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn always(value: Value) -> Self {
        Self::new(vec![Ok(value)])
    }

    pub(crate) fn always_err(err: StepExecutionError) -> Self {
        Self::new(vec![Err(err)])
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared counter of invocations, readable after the handler is moved.
    pub(crate) fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl TaskHandler for Scripted {
    async fn execute(&self, _config: &Value) -> Result<Value, StepExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let index = call.min(self.script.len().saturating_sub(1));
        self.script
            .get(index)
            .cloned()
            .unwrap_or_else(|| Ok(Value::Null))
    }
}

/// Create and activate a workflow whose steps are `(step name, task type)`.
pub(crate) async fn activate_workflow(
    repo: &InMemoryRepository,
    name: &str,
    steps: &[(&str, &str)],
) -> Workflow {
    let service = WorkflowService::new(repo.clone());
    let wf = service.create_workflow(name, None).await.unwrap();
    for (step_name, task_type) in steps {
        service
            .add_step(
                &wf.id,
                NewStep {
                    name: step_name.to_string(),
                    task_type: (*task_type).into(),
                    config: json!({}),
                    timeout_secs: None,
                    max_attempts: None,
                },
            )
            .await
            .unwrap();
    }
    service.activate(&wf.id).await.unwrap()
}
