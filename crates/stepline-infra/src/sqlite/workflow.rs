//! SQLite workflow repository implementation.
//!
//! Workflows and steps live in separate tables; `(workflow_id, position)`
//! and `(workflow_id, name)` uniqueness is enforced by the schema.

use chrono::Utc;
use sqlx::Row;
use stepline_core::repository::workflow::WorkflowRepository;
use stepline_types::error::RepositoryError;
use stepline_types::workflow::{Step, TaskType, Workflow, WorkflowStatus};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_enum, parse_uuid, query_error};

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, workflow_id: &Uuid) -> Result<Vec<Step>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE workflow_id = ? ORDER BY position ASC")
            .bind(workflow_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| StepRow::from_row(row).map_err(query_error)?.into_step())
            .collect()
    }

    async fn with_steps(
        &self,
        row: Option<sqlx::sqlite::SqliteRow>,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let mut workflow = WorkflowRow::from_row(&row)
            .map_err(query_error)?
            .into_workflow()?;
        workflow.steps = self.load_steps(&workflow.id).await?;
        Ok(Some(workflow))
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    name: String,
    description: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        Ok(Workflow {
            id: parse_uuid(&self.id)?,
            name: self.name,
            description: self.description,
            status: parse_enum(&self.status, "workflow status")?,
            steps: vec![],
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    id: String,
    workflow_id: String,
    name: String,
    task_type: String,
    position: i64,
    config: String,
    timeout_secs: Option<i64>,
    max_attempts: Option<i64>,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            name: row.try_get("name")?,
            task_type: row.try_get("task_type")?,
            position: row.try_get("position")?,
            config: row.try_get("config")?,
            timeout_secs: row.try_get("timeout_secs")?,
            max_attempts: row.try_get("max_attempts")?,
        })
    }

    fn into_step(self) -> Result<Step, RepositoryError> {
        let config = serde_json::from_str(&self.config)
            .map_err(|e| RepositoryError::Query(format!("invalid step config JSON: {e}")))?;
        Ok(Step {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            name: self.name,
            task_type: TaskType::from(self.task_type),
            position: self.position as u32,
            config,
            timeout_secs: self.timeout_secs.map(|v| v as u64),
            max_attempts: self.max_attempts.map(|v| v as u32),
        })
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflows (id, name, description, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.status.as_str())
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(RepositoryError::Conflict(format!(
                    "workflow name '{}' already exists",
                    workflow.name
                )))
            }
            Err(e) => Err(query_error(e)),
        }
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        self.with_steps(row).await
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        self.with_steps(row).await
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflows ORDER BY name ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(workflow) = self.with_steps(Some(row)).await? {
                workflows.push(workflow);
            }
        }
        Ok(workflows)
    }

    async fn append_step(&self, step: &Step) -> Result<(), RepositoryError> {
        let config = serde_json::to_string(&step.config)
            .map_err(|e| RepositoryError::Query(format!("serialize step config: {e}")))?;

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        // The draft check and the insert are one statement.
        let inserted = sqlx::query(
            r#"INSERT INTO steps
               (id, workflow_id, name, task_type, position, config, timeout_secs, max_attempts)
               SELECT ?, ?, ?, ?, ?, ?, ?, ?
               WHERE EXISTS (SELECT 1 FROM workflows WHERE id = ? AND status = ?)"#,
        )
        .bind(step.id.to_string())
        .bind(step.workflow_id.to_string())
        .bind(&step.name)
        .bind(step.task_type.as_str())
        .bind(step.position as i64)
        .bind(&config)
        .bind(step.timeout_secs.map(|v| v as i64))
        .bind(step.max_attempts.map(|v| v as i64))
        .bind(step.workflow_id.to_string())
        .bind(WorkflowStatus::Draft.as_str())
        .execute(&mut *tx)
        .await;

        let result = match inserted {
            Ok(result) => result,
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                return Err(RepositoryError::Conflict(format!(
                    "step '{}' at position {} conflicts with an existing step",
                    step.name, step.position
                )));
            }
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("FOREIGN KEY") => {
                return Err(RepositoryError::NotFound);
            }
            Err(e) => return Err(query_error(e)),
        };

        if result.rows_affected() == 0 {
            return Err(match current_status(&mut *tx, &step.workflow_id).await? {
                Some(status) => RepositoryError::UnexpectedStatus(status),
                None => RepositoryError::NotFound,
            });
        }

        sqlx::query("UPDATE workflows SET updated_at = ? WHERE id = ?")
            .bind(format_datetime(&Utc::now()))
            .bind(step.workflow_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        tx.commit().await.map_err(query_error)
    }

    async fn update_workflow_status(
        &self,
        id: &Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(
            "UPDATE workflows SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(match current_status(&mut *tx, id).await? {
                Some(status) => RepositoryError::UnexpectedStatus(status),
                None => RepositoryError::NotFound,
            });
        }
        tx.commit().await.map_err(query_error)
    }
}

/// Status of a workflow, `None` if it does not exist.
async fn current_status(
    conn: &mut sqlx::SqliteConnection,
    id: &Uuid,
) -> Result<Option<WorkflowStatus>, RepositoryError> {
    let status: Option<(String,)> = sqlx::query_as("SELECT status FROM workflows WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(conn)
        .await
        .map_err(query_error)?;
    status
        .map(|(s,)| parse_enum(&s, "workflow status"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_util::test_pool;
    use serde_json::json;

    fn sample_workflow(name: &str) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: Some("nightly export".to_string()),
            status: WorkflowStatus::Draft,
            steps: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_step(workflow_id: Uuid, name: &str, position: u32) -> Step {
        Step {
            id: Uuid::now_v7(),
            workflow_id,
            name: name.to_string(),
            task_type: TaskType::HttpRequest,
            position,
            config: json!({"url": "https://example.com/hook", "method": "POST"}),
            timeout_secs: Some(10),
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_workflow_with_steps() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow("export");
        repo.create_workflow(&wf).await.unwrap();
        repo.append_step(&sample_step(wf.id, "second", 1)).await.unwrap();
        repo.append_step(&sample_step(wf.id, "first", 0)).await.unwrap();

        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "export");
        assert_eq!(loaded.description.as_deref(), Some("nightly export"));
        assert_eq!(loaded.status, WorkflowStatus::Draft);
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.steps[0].name, "first");
        assert_eq!(loaded.steps[0].task_type, TaskType::HttpRequest);
        assert_eq!(loaded.steps[0].timeout_secs, Some(10));
        assert_eq!(loaded.steps[1].config["method"], "POST");

        let by_name = repo.get_workflow_by_name("export").await.unwrap().unwrap();
        assert_eq!(by_name.id, wf.id);
    }

    #[tokio::test]
    async fn test_duplicate_workflow_name_conflicts() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        repo.create_workflow(&sample_workflow("dup")).await.unwrap();
        let err = repo.create_workflow(&sample_workflow("dup")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_duplicate_position_conflicts() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow("wf");
        repo.create_workflow(&wf).await.unwrap();
        repo.append_step(&sample_step(wf.id, "a", 0)).await.unwrap();
        let err = repo.append_step(&sample_step(wf.id, "b", 0)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_append_step_to_missing_workflow() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let err = repo
            .append_step(&sample_step(Uuid::now_v7(), "a", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_update_status_and_list() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let b = sample_workflow("b-flow");
        let a = sample_workflow("a-flow");
        repo.create_workflow(&b).await.unwrap();
        repo.create_workflow(&a).await.unwrap();

        repo.update_workflow_status(&a.id, WorkflowStatus::Draft, WorkflowStatus::Active)
            .await
            .unwrap();

        let all = repo.list_workflows().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "a-flow");
        assert_eq!(all[0].status, WorkflowStatus::Active);

        let err = repo
            .update_workflow_status(&Uuid::now_v7(), WorkflowStatus::Draft, WorkflowStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_status_update_requires_expected_status() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow("guarded");
        repo.create_workflow(&wf).await.unwrap();
        repo.update_workflow_status(&wf.id, WorkflowStatus::Draft, WorkflowStatus::Active)
            .await
            .unwrap();

        let err = repo
            .update_workflow_status(&wf.id, WorkflowStatus::Draft, WorkflowStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::UnexpectedStatus(WorkflowStatus::Active)
        ));

        let err = repo
            .update_workflow_status(&wf.id, WorkflowStatus::Draft, WorkflowStatus::Archived)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::UnexpectedStatus(_)));
        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Active);
    }

    #[tokio::test]
    async fn test_append_step_rejected_once_active() {
        let repo = SqliteWorkflowRepository::new(test_pool().await);
        let wf = sample_workflow("frozen");
        repo.create_workflow(&wf).await.unwrap();
        repo.append_step(&sample_step(wf.id, "first", 0)).await.unwrap();
        repo.update_workflow_status(&wf.id, WorkflowStatus::Draft, WorkflowStatus::Active)
            .await
            .unwrap();

        let err = repo
            .append_step(&sample_step(wf.id, "late", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::UnexpectedStatus(WorkflowStatus::Active)
        ));
        let loaded = repo.get_workflow(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 1);
    }
}
