//! SQLite execution repository implementation.
//!
//! Ownership changes are single conditional statements against the writer
//! connection, so two workers racing for the same execution cannot both
//! succeed. The workflow snapshot, attempt counters and step outputs are
//! stored as JSON text.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepline_core::repository::execution::{ExecutionRepository, RecoveryQuery};
use stepline_types::error::RepositoryError;
use stepline_types::execution::{Execution, StepAttempt};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_enum, parse_uuid, query_error};

/// SQLite-backed implementation of `ExecutionRepository`.
#[derive(Clone)]
pub struct SqliteExecutionRepository {
    pool: DatabasePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    idempotency_key: String,
    snapshot: String,
    status: String,
    current_step_index: i64,
    attempt_counts: String,
    output: String,
    error: Option<String>,
    owner: Option<String>,
    leased_at: Option<String>,
    next_attempt_at: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            snapshot: row.try_get("snapshot")?,
            status: row.try_get("status")?,
            current_step_index: row.try_get("current_step_index")?,
            attempt_counts: row.try_get("attempt_counts")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            owner: row.try_get("owner")?,
            leased_at: row.try_get("leased_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_execution(self) -> Result<Execution, RepositoryError> {
        Ok(Execution {
            id: parse_uuid(&self.id)?,
            workflow: from_json(&self.snapshot, "snapshot")?,
            idempotency_key: self.idempotency_key,
            status: parse_enum(&self.status, "execution status")?,
            current_step_index: self.current_step_index as u32,
            attempt_counts: from_json(&self.attempt_counts, "attempt counts")?,
            output: from_json(&self.output, "output")?,
            error: self.error,
            owner: self.owner,
            leased_at: parse_optional(self.leased_at.as_deref())?,
            next_attempt_at: parse_optional(self.next_attempt_at.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
            started_at: parse_optional(self.started_at.as_deref())?,
            completed_at: parse_optional(self.completed_at.as_deref())?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct AttemptRow {
    id: String,
    execution_id: String,
    step_index: i64,
    step_name: String,
    attempt: i64,
    outcome: String,
    error_kind: Option<String>,
    error: Option<String>,
    output: Option<String>,
    started_at: String,
    finished_at: String,
}

impl AttemptRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_index: row.try_get("step_index")?,
            step_name: row.try_get("step_name")?,
            attempt: row.try_get("attempt")?,
            outcome: row.try_get("outcome")?,
            error_kind: row.try_get("error_kind")?,
            error: row.try_get("error")?,
            output: row.try_get("output")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn into_attempt(self) -> Result<StepAttempt, RepositoryError> {
        Ok(StepAttempt {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_index: self.step_index as u32,
            step_name: self.step_name,
            attempt: self.attempt as u32,
            outcome: parse_enum(&self.outcome, "attempt outcome")?,
            error_kind: self
                .error_kind
                .as_deref()
                .map(|k| parse_enum(k, "failure kind"))
                .transpose()?,
            error: self.error,
            output: self
                .output
                .as_deref()
                .map(|o| from_json(o, "attempt output"))
                .transpose()?,
            started_at: parse_datetime(&self.started_at)?,
            finished_at: parse_datetime(&self.finished_at)?,
        })
    }
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn parse_optional(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, RepositoryError> {
    ExecutionRow::from_row(row)
        .map_err(query_error)?
        .into_execution()
}

// ---------------------------------------------------------------------------
// ExecutionRepository impl
// ---------------------------------------------------------------------------

impl ExecutionRepository for SqliteExecutionRepository {
    async fn insert_if_absent(
        &self,
        execution: &Execution,
    ) -> Result<(Execution, bool), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, idempotency_key, snapshot, status, current_step_index,
                attempt_counts, output, error, owner, leased_at, next_attempt_at,
                created_at, started_at, completed_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(idempotency_key) DO NOTHING"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow.workflow_id.to_string())
        .bind(&execution.idempotency_key)
        .bind(to_json(&execution.workflow, "snapshot")?)
        .bind(execution.status.as_str())
        .bind(execution.current_step_index as i64)
        .bind(to_json(&execution.attempt_counts, "attempt counts")?)
        .bind(to_json(&execution.output, "output")?)
        .bind(&execution.error)
        .bind(&execution.owner)
        .bind(execution.leased_at.as_ref().map(format_datetime))
        .bind(execution.next_attempt_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 1 {
            return Ok((execution.clone(), true));
        }

        // Reads go through the writer so the winning row is visible.
        let row = sqlx::query("SELECT * FROM executions WHERE idempotency_key = ?")
            .bind(&execution.idempotency_key)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_error)?;
        match row {
            Some(row) => Ok((execution_from_row(&row)?, false)),
            None => Err(RepositoryError::Conflict(format!(
                "execution id {} already exists",
                execution.id
            ))),
        }
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn get_execution_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn claim_execution(
        &self,
        id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<Execution>, RepositoryError> {
        let now_s = format_datetime(&now);
        let row = sqlx::query(
            r#"UPDATE executions
               SET status = 'running',
                   owner = ?,
                   leased_at = ?,
                   next_attempt_at = NULL,
                   started_at = COALESCE(started_at, ?),
                   updated_at = ?
               WHERE id = ?
                 AND (status = 'pending'
                      OR (status = 'retrying' AND (next_attempt_at IS NULL OR next_attempt_at <= ?))
                      OR (status = 'running' AND (leased_at IS NULL OR leased_at < ?)))
               RETURNING *"#,
        )
        .bind(worker)
        .bind(&now_s)
        .bind(&now_s)
        .bind(&now_s)
        .bind(id.to_string())
        .bind(&now_s)
        .bind(format_datetime(&stale_before))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_error)?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn renew_lease(
        &self,
        id: &Uuid,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let now_s = format_datetime(&now);
        let result = sqlx::query(
            r#"UPDATE executions SET leased_at = ?, updated_at = ?
               WHERE id = ? AND status = 'running' AND owner = ?"#,
        )
        .bind(&now_s)
        .bind(&now_s)
        .bind(id.to_string())
        .bind(worker)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_attempt(
        &self,
        execution: &Execution,
        attempt: &StepAttempt,
        worker: &str,
    ) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let updated = sqlx::query(
            r#"UPDATE executions
               SET status = ?, current_step_index = ?, attempt_counts = ?, output = ?,
                   error = ?, owner = ?, leased_at = ?, next_attempt_at = ?,
                   started_at = ?, completed_at = ?, updated_at = ?
               WHERE id = ? AND owner = ? AND status NOT IN ('completed', 'failed')"#,
        )
        .bind(execution.status.as_str())
        .bind(execution.current_step_index as i64)
        .bind(to_json(&execution.attempt_counts, "attempt counts")?)
        .bind(to_json(&execution.output, "output")?)
        .bind(&execution.error)
        .bind(&execution.owner)
        .bind(execution.leased_at.as_ref().map(format_datetime))
        .bind(execution.next_attempt_at.as_ref().map(format_datetime))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.id.to_string())
        .bind(worker)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(query_error)?;
            return Ok(false);
        }

        let output = attempt
            .output
            .as_ref()
            .map(|o| to_json(o, "attempt output"))
            .transpose()?;
        sqlx::query(
            r#"INSERT INTO step_attempts
               (id, execution_id, step_index, step_name, attempt, outcome,
                error_kind, error, output, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.id.to_string())
        .bind(attempt.execution_id.to_string())
        .bind(attempt.step_index as i64)
        .bind(&attempt.step_name)
        .bind(attempt.attempt as i64)
        .bind(attempt.outcome.as_str())
        .bind(attempt.error_kind.map(|k| k.as_str()))
        .bind(&attempt.error)
        .bind(output)
        .bind(format_datetime(&attempt.started_at))
        .bind(format_datetime(&attempt.finished_at))
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(true)
    }

    async fn list_attempts(&self, execution_id: &Uuid) -> Result<Vec<StepAttempt>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_attempts WHERE execution_id = ? ORDER BY seq ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        rows.iter()
            .map(|row| AttemptRow::from_row(row).map_err(query_error)?.into_attempt())
            .collect()
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM executions WHERE workflow_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM executions ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit as i64)
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn list_recoverable(&self, query: &RecoveryQuery) -> Result<Vec<Uuid>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"SELECT id FROM executions
               WHERE (status = 'pending' AND created_at < ?)
                  OR (status = 'running' AND (leased_at IS NULL OR leased_at < ?))
                  OR (status = 'retrying' AND (next_attempt_at IS NULL OR next_attempt_at <= ?))
               ORDER BY created_at ASC
               LIMIT ?"#,
        )
        .bind(format_datetime(&query.pending_before))
        .bind(format_datetime(&query.lease_before))
        .bind(format_datetime(&query.due_by))
        .bind(query.limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(|(id,)| parse_uuid(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_util::test_pool;
    use crate::sqlite::workflow::SqliteWorkflowRepository;
    use chrono::TimeDelta;
    use serde_json::json;
    use stepline_core::repository::workflow::WorkflowRepository;
    use stepline_types::execution::{AttemptOutcome, ExecutionStatus, FailureKind};
    use stepline_types::workflow::{Step, TaskType, Workflow, WorkflowSnapshot, WorkflowStatus};

    async fn setup() -> (SqliteExecutionRepository, WorkflowSnapshot) {
        let pool = test_pool().await;
        let workflows = SqliteWorkflowRepository::new(pool.clone());
        let now = Utc::now();
        let wf = Workflow {
            id: Uuid::now_v7(),
            name: format!("wf-{}", Uuid::now_v7().simple()),
            description: None,
            status: WorkflowStatus::Draft,
            steps: vec![],
            created_at: now,
            updated_at: now,
        };
        workflows.create_workflow(&wf).await.unwrap();
        let step = Step {
            id: Uuid::now_v7(),
            workflow_id: wf.id,
            name: "notify".to_string(),
            task_type: TaskType::HttpRequest,
            position: 0,
            config: json!({"url": "http://localhost/notify"}),
            timeout_secs: None,
            max_attempts: Some(5),
        };
        workflows.append_step(&step).await.unwrap();
        workflows
            .update_workflow_status(&wf.id, WorkflowStatus::Draft, WorkflowStatus::Active)
            .await
            .unwrap();
        let loaded = workflows.get_workflow(&wf.id).await.unwrap().unwrap();
        (
            SqliteExecutionRepository::new(pool),
            WorkflowSnapshot::from(&loaded),
        )
    }

    fn failed_attempt(execution: &Execution) -> StepAttempt {
        let now = Utc::now();
        StepAttempt {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            step_index: 0,
            step_name: "notify".to_string(),
            attempt: 1,
            outcome: AttemptOutcome::Failed,
            error_kind: Some(FailureKind::Unavailable),
            error: Some("connection refused".to_string()),
            output: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_returns_existing_for_same_key() {
        let (repo, snapshot) = setup().await;
        let first = Execution::new(snapshot.clone(), "order-1");
        let (stored, created) = repo.insert_if_absent(&first).await.unwrap();
        assert!(created);
        assert_eq!(stored.id, first.id);

        let second = Execution::new(snapshot, "order-1");
        let (stored, created) = repo.insert_if_absent(&second).await.unwrap();
        assert!(!created);
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.workflow.steps[0].max_attempts, Some(5));

        let by_key = repo.get_execution_by_key("order-1").await.unwrap().unwrap();
        assert_eq!(by_key.id, first.id);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_create_one_row() {
        let (repo, snapshot) = setup().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            let exec = Execution::new(snapshot.clone(), "same-key");
            handles.push(tokio::spawn(async move {
                repo.insert_if_absent(&exec).await.unwrap()
            }));
        }
        let mut created = 0;
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let (exec, was_created) = handle.await.unwrap();
            if was_created {
                created += 1;
            }
            ids.insert(exec.id);
        }
        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_is_stale() {
        let (repo, snapshot) = setup().await;
        let exec = Execution::new(snapshot, "claim-me");
        repo.insert_if_absent(&exec).await.unwrap();

        let now = Utc::now();
        let stale_before = now - TimeDelta::seconds(120);
        let claimed = repo
            .claim_execution(&exec.id, "w1", now, stale_before)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, ExecutionStatus::Running);
        assert_eq!(claimed.owner.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());

        let second = repo
            .claim_execution(&exec.id, "w2", now, stale_before)
            .await
            .unwrap();
        assert!(second.is_none());

        // A later claim with a cut-off past w1's lease takes over.
        let later = now + TimeDelta::seconds(300);
        let taken = repo
            .claim_execution(&exec.id, "w2", later, later - TimeDelta::seconds(120))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.owner.as_deref(), Some("w2"));
        assert_eq!(taken.started_at, claimed.started_at);

        assert!(!repo.renew_lease(&exec.id, "w1", later).await.unwrap());
        assert!(repo.renew_lease(&exec.id, "w2", later).await.unwrap());
    }

    #[tokio::test]
    async fn test_retrying_not_claimable_before_due() {
        let (repo, snapshot) = setup().await;
        let exec = Execution::new(snapshot, "retry-later");
        repo.insert_if_absent(&exec).await.unwrap();

        let now = Utc::now();
        let mut running = repo
            .claim_execution(&exec.id, "w1", now, now)
            .await
            .unwrap()
            .unwrap();
        running.status = ExecutionStatus::Retrying;
        running.owner = None;
        running.leased_at = None;
        running.next_attempt_at = Some(now + TimeDelta::seconds(10));
        running.attempt_counts.insert(0, 1);
        assert!(repo
            .record_attempt(&running, &failed_attempt(&running), "w1")
            .await
            .unwrap());

        assert!(repo
            .claim_execution(&exec.id, "w2", now, now)
            .await
            .unwrap()
            .is_none());

        let due = now + TimeDelta::seconds(11);
        let claimed = repo
            .claim_execution(&exec.id, "w2", due, due)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts_for(0), 1);
        assert!(claimed.next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn test_record_attempt_requires_ownership() {
        let (repo, snapshot) = setup().await;
        let exec = Execution::new(snapshot, "owned");
        repo.insert_if_absent(&exec).await.unwrap();
        let now = Utc::now();
        let mut running = repo
            .claim_execution(&exec.id, "w1", now, now)
            .await
            .unwrap()
            .unwrap();

        running.attempt_counts.insert(0, 1);
        let written = repo
            .record_attempt(&running, &failed_attempt(&running), "intruder")
            .await
            .unwrap();
        assert!(!written);
        assert!(repo.list_attempts(&exec.id).await.unwrap().is_empty());

        running.status = ExecutionStatus::Completed;
        running.current_step_index = 1;
        running.output.insert("notify".to_string(), json!({"ok": true}));
        running.completed_at = Some(now);
        let mut success = failed_attempt(&running);
        success.outcome = AttemptOutcome::Succeeded;
        success.error_kind = None;
        success.error = None;
        success.output = Some(json!({"ok": true}));
        assert!(repo.record_attempt(&running, &success, "w1").await.unwrap());

        let stored = repo.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.output["notify"], json!({"ok": true}));

        let attempts = repo.list_attempts(&exec.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Succeeded);
        assert_eq!(attempts[0].output, Some(json!({"ok": true})));

        // Terminal rows accept no further writes, even from the owner.
        assert!(!repo.record_attempt(&running, &success, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_recoverable_and_list_executions() {
        let (repo, snapshot) = setup().await;
        let pending = Execution::new(snapshot.clone(), "pending");
        let running = Execution::new(snapshot.clone(), "running");
        repo.insert_if_absent(&pending).await.unwrap();
        repo.insert_if_absent(&running).await.unwrap();

        let now = Utc::now();
        repo.claim_execution(&running.id, "w1", now, now)
            .await
            .unwrap()
            .unwrap();

        let later = now + TimeDelta::seconds(1);
        let fresh_only = repo
            .list_recoverable(&RecoveryQuery {
                pending_before: later,
                lease_before: now - TimeDelta::seconds(60),
                due_by: later,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(fresh_only, vec![pending.id]);

        let all = repo
            .list_recoverable(&RecoveryQuery {
                pending_before: later,
                lease_before: later,
                due_by: later,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let listed = repo
            .list_executions(Some(&snapshot.workflow_id), 10)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, running.id);
        assert!(repo
            .list_executions(Some(&Uuid::now_v7()), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
