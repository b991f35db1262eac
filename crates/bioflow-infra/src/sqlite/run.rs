//! SQLite run repository.
//!
//! Implements `RunRepository` with manual row mapping: UUIDs and timestamps
//! travel as TEXT, JSON payloads as TEXT blobs, statuses as their wire
//! strings. Writes go through the single-connection writer pool; queries
//! through the reader pool.

use bioflow_core::repository::RunRepository;
use bioflow_types::error::RepositoryError;
use bioflow_types::run::{RunRecord, RunStatus, StepExecution, StepStatus, WorkflowRecord};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    name: String,
    version: String,
    description: Option<String>,
    definition: String,
    created_at: String,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            description: row.try_get("description")?,
            definition: row.try_get("definition")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<WorkflowRecord, RepositoryError> {
        Ok(WorkflowRecord {
            id: parse_uuid(&self.id)?,
            name: self.name,
            version: self.version,
            description: self.description,
            definition: parse_json(&self.definition)?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct RunRow {
    run_id: String,
    workflow_id: String,
    workflow_name: String,
    workflow_version: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
    inputs: String,
    run_dir: String,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            inputs: row.try_get("inputs")?,
            run_dir: row.try_get("run_dir")?,
            error: row.try_get("error")?,
        })
    }

    fn into_record(self) -> Result<RunRecord, RepositoryError> {
        let status: RunStatus = parse_status(&self.status)?;
        Ok(RunRecord {
            run_id: self.run_id,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            workflow_version: self.workflow_version,
            status,
            start_time: parse_datetime(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            inputs: parse_json(&self.inputs)?,
            run_dir: self.run_dir,
            error: self.error,
        })
    }
}

struct StepRow {
    id: String,
    run_id: String,
    step_name: String,
    status: String,
    attempt: i64,
    start_time: Option<String>,
    end_time: Option<String>,
    exit_code: Option<i64>,
    error: Option<String>,
    log_file: Option<String>,
    outputs: String,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            exit_code: row.try_get("exit_code")?,
            error: row.try_get("error")?,
            log_file: row.try_get("log_file")?,
            outputs: row.try_get("outputs")?,
        })
    }

    fn into_record(self) -> Result<StepExecution, RepositoryError> {
        let status: StepStatus = parse_status(&self.status)?;
        let outputs: Vec<String> = serde_json::from_str(&self.outputs)
            .map_err(|e| RepositoryError::Query(format!("invalid outputs JSON: {e}")))?;
        Ok(StepExecution {
            id: parse_uuid(&self.id)?,
            run_id: self.run_id,
            step_name: self.step_name,
            status,
            attempt: self.attempt as u32,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            exit_code: self.exit_code,
            error: self.error,
            log_file: self.log_file,
            outputs,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_json(s: &str) -> Result<serde_json::Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid JSON: {e}")))
}

fn parse_status<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid status: {s}")))
}

fn status_text<T: serde::Serialize>(status: &T) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn db_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Database(e.to_string())
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_workflow(
        &self,
        record: &WorkflowRecord,
    ) -> Result<WorkflowRecord, RepositoryError> {
        // Idempotent registration: a duplicate (name, version) leaves the
        // stored row untouched and returns it.
        sqlx::query(
            r#"INSERT INTO workflows (id, name, version, description, definition, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(name, version) DO NOTHING"#,
        )
        .bind(record.id.to_string())
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.description)
        .bind(record.definition.to_string())
        .bind(format_datetime(&record.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        self.get_workflow_by_name_version(&record.name, &record.version)
            .await?
            .ok_or_else(|| {
                RepositoryError::Query(format!(
                    "workflow {}@{} missing after upsert",
                    record.name, record.version
                ))
            })
    }

    async fn get_workflow_by_name_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT id, name, version, description, definition, created_at
               FROM workflows WHERE name = ? AND version = ?"#,
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;

        row.map(|r| WorkflowRow::from_row(&r).map_err(db_err)?.into_record())
            .transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, name, version, description, definition, created_at
               FROM workflows ORDER BY created_at DESC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| WorkflowRow::from_row(r).map_err(db_err)?.into_record())
            .collect()
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT id, name, version, description, definition, created_at
               FROM workflows WHERE id = ?"#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;

        row.map(|r| WorkflowRow::from_row(&r).map_err(db_err)?.into_record())
            .transpose()
    }

    async fn create_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO runs (run_id, workflow_id, workflow_name, workflow_version,
                                 status, start_time, end_time, inputs, run_dir, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&run.run_id)
        .bind(run.workflow_id.to_string())
        .bind(&run.workflow_name)
        .bind(&run.workflow_version)
        .bind(status_text(&run.status))
        .bind(format_datetime(&run.start_time))
        .bind(run.end_time.as_ref().map(format_datetime))
        .bind(run.inputs.to_string())
        .bind(&run.run_dir)
        .bind(&run.error)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE runs SET status = ?, end_time = ?, error = ? WHERE run_id = ?"#,
        )
        .bind(status_text(&status))
        .bind(end_time.as_ref().map(format_datetime))
        .bind(error)
        .bind(run_id)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(run_id.to_string()));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT run_id, workflow_id, workflow_name, workflow_version, status,
                      start_time, end_time, inputs, run_dir, error
               FROM runs WHERE run_id = ?"#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;

        row.map(|r| RunRow::from_row(&r).map_err(db_err)?.into_record())
            .transpose()
    }

    async fn list_runs(
        &self,
        workflow_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = match workflow_name {
            Some(name) => {
                sqlx::query(
                    r#"SELECT run_id, workflow_id, workflow_name, workflow_version, status,
                              start_time, end_time, inputs, run_dir, error
                       FROM runs WHERE workflow_name = ?
                       ORDER BY start_time DESC LIMIT ?"#,
                )
                .bind(name)
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    r#"SELECT run_id, workflow_id, workflow_name, workflow_version, status,
                              start_time, end_time, inputs, run_dir, error
                       FROM runs ORDER BY start_time DESC LIMIT ?"#,
                )
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(db_err)?;

        rows.iter()
            .map(|r| RunRow::from_row(r).map_err(db_err)?.into_record())
            .collect()
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), RepositoryError> {
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(run_id.to_string()))?;

        if !run.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is {} and cannot be deleted",
                run.status
            )));
        }

        // step_executions rows go with the run via ON DELETE CASCADE.
        sqlx::query("DELETE FROM runs WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;

        tracing::info!(run_id, "deleted run");
        Ok(())
    }

    async fn add_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO step_executions (id, run_id, step_name, status, attempt,
                                            start_time, end_time, exit_code, error, log_file, outputs)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(step.id.to_string())
        .bind(&step.run_id)
        .bind(&step.step_name)
        .bind(status_text(&step.status))
        .bind(step.attempt as i64)
        .bind(step.start_time.as_ref().map(format_datetime))
        .bind(step.end_time.as_ref().map(format_datetime))
        .bind(step.exit_code)
        .bind(&step.error)
        .bind(&step.log_file)
        .bind(serde_json::to_string(&step.outputs).unwrap_or_else(|_| "[]".to_string()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        // Upsert keyed by the row ID so a retried update is idempotent.
        sqlx::query(
            r#"INSERT INTO step_executions (id, run_id, step_name, status, attempt,
                                            start_time, end_time, exit_code, error, log_file, outputs)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 start_time = excluded.start_time,
                 end_time = excluded.end_time,
                 exit_code = excluded.exit_code,
                 error = excluded.error,
                 log_file = excluded.log_file,
                 outputs = excluded.outputs"#,
        )
        .bind(step.id.to_string())
        .bind(&step.run_id)
        .bind(&step.step_name)
        .bind(status_text(&step.status))
        .bind(step.attempt as i64)
        .bind(step.start_time.as_ref().map(format_datetime))
        .bind(step.end_time.as_ref().map(format_datetime))
        .bind(step.exit_code)
        .bind(&step.error)
        .bind(&step.log_file)
        .bind(serde_json::to_string(&step.outputs).unwrap_or_else(|_| "[]".to_string()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn list_step_executions(
        &self,
        run_id: &str,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT id, run_id, step_name, status, attempt, start_time, end_time,
                      exit_code, error, log_file, outputs
               FROM step_executions WHERE run_id = ?
               ORDER BY start_time ASC, attempt ASC"#,
        )
        .bind(run_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| StepRow::from_row(r).map_err(db_err)?.into_record())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
