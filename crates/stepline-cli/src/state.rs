//! Application state wiring the SQLite adapters into the engine.
//!
//! Services are generic over repository and queue traits; `AppState` pins
//! them to the concrete infra implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use stepline_core::execution::engine::Engine;
use stepline_core::service::workflow::WorkflowService;
use stepline_infra::config::{load_config, resolve_data_dir};
use stepline_infra::sqlite::execution::SqliteExecutionRepository;
use stepline_infra::sqlite::pool::DatabasePool;
use stepline_infra::sqlite::queue::SqliteDispatchQueue;
use stepline_infra::sqlite::workflow::SqliteWorkflowRepository;
use stepline_infra::task::default_step_executor;
use stepline_types::config::EngineConfig;

pub type ConcreteWorkflowService = WorkflowService<SqliteWorkflowRepository>;

pub type ConcreteEngine =
    Engine<SqliteWorkflowRepository, SqliteExecutionRepository, SqliteDispatchQueue>;

/// Shared state for CLI commands.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub db_pool: DatabasePool,
    pub workflow_service: ConcreteWorkflowService,
    pub executions: Arc<SqliteExecutionRepository>,
}

impl AppState {
    /// Resolve the data dir, load config, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;
        config.validate().context("invalid config.toml")?;

        let db_pool = DatabasePool::open_in(&data_dir)
            .await
            .context("failed to open database")?;

        Ok(Self {
            workflow_service: WorkflowService::new(SqliteWorkflowRepository::new(db_pool.clone())),
            executions: Arc::new(SqliteExecutionRepository::new(db_pool.clone())),
            data_dir,
            config,
            db_pool,
        })
    }

    /// Build an engine over the shared pool with the loaded config.
    pub fn engine(&self) -> anyhow::Result<ConcreteEngine> {
        self.engine_with(self.config.clone())
    }

    /// Build an engine with an adjusted copy of the config.
    pub fn engine_with(&self, config: EngineConfig) -> anyhow::Result<ConcreteEngine> {
        let executor =
            default_step_executor(&config).context("failed to build the HTTP client")?;
        Ok(Engine::new(
            Arc::new(SqliteWorkflowRepository::new(self.db_pool.clone())),
            self.executions.clone(),
            Arc::new(SqliteDispatchQueue::new(
                self.db_pool.clone(),
                config.worker.poll_interval(),
            )),
            executor,
            config,
        ))
    }
}
