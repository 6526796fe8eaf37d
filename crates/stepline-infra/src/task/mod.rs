//! Built-in task handlers.

pub mod http_request;

use stepline_core::execution::step_executor::StepExecutor;
use stepline_types::config::EngineConfig;
use stepline_types::workflow::TaskType;

pub use http_request::HttpRequestHandler;

/// A step executor with every built-in task type registered.
pub fn default_step_executor(config: &EngineConfig) -> Result<StepExecutor, reqwest::Error> {
    let http = HttpRequestHandler::new(&config.http)?;
    Ok(StepExecutor::new(config.executor.step_timeout()).with_handler(TaskType::HttpRequest, http))
}
