use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{LogRecord, NewLogRecord, StatusHint, Task, TaskOutcome, TaskStatus};
use crate::store::{LogSink, TaskStore};

const TASK_COLUMNS: &str =
  "id, task_type, status, parameter, result, error, priority, created_at, started_at, end_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  async fn task_exists(&self, id: Uuid) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM tasks WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.is_some())
  }
}

fn task_from_row(row: &PgRow) -> Result<Task> {
  let task_type: String = row.try_get("task_type")?;
  let status: String = row.try_get("status")?;
  Ok(Task {
    id: row.try_get("id")?,
    task_type: task_type.parse()?,
    status: status.parse()?,
    parameter: row.try_get("parameter")?,
    result: row.try_get("result")?,
    error: row.try_get("error")?,
    priority: row.try_get("priority")?,
    created_at: row.try_get("created_at")?,
    started_at: row.try_get("started_at")?,
    end_at: row.try_get("end_at")?,
    updated_at: row.try_get("updated_at")?,
  })
}

fn log_from_row(row: &PgRow) -> Result<LogRecord> {
  Ok(LogRecord {
    id: row.try_get("id")?,
    timestamp: row.try_get("timestamp")?,
    observed_timestamp: row.try_get("observed_timestamp")?,
    trace_id: row.try_get("trace_id")?,
    span_id: row.try_get("span_id")?,
    severity_text: row.try_get("severity_text")?,
    severity_number: row.try_get("severity_number")?,
    body: row.try_get("body")?,
    resource: row.try_get("resource")?,
    attributes: row.try_get("attributes")?,
    created_at: row.try_get("created_at")?,
  })
}

#[async_trait]
impl TaskStore for PgStore {
  async fn insert_task(&self, task: &Task) -> Result<()> {
    sqlx::query(
      "INSERT INTO tasks (id, task_type, status, parameter, priority, created_at, updated_at)
       VALUES ($1, $2, $3, $4, $5, $6, $6)",
    )
      .bind(task.id)
      .bind(task.task_type.as_str())
      .bind(task.status.as_str())
      .bind(&task.parameter)
      .bind(task.priority)
      .bind(task.created_at)
      .execute(&self.pool)
      .await
      .with_context(|| format!("Failed to insert task {}", task.id))?;
    Ok(())
  }

  async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
    let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS))
      .bind(id)
      .fetch_optional(&self.pool)
      .await
      .with_context(|| format!("Failed to load task {}", id))?;
    row.as_ref().map(task_from_row).transpose()
  }

  async fn mark_running(&self, id: Uuid) -> Result<bool> {
    let done = sqlx::query(
      "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, NOW()), updated_at = NOW()
       WHERE id = $1 AND status IN ('pending', 'running')",
    )
      .bind(id)
      .execute(&self.pool)
      .await
      .with_context(|| format!("Failed to mark task {} running", id))?;
    Ok(done.rows_affected() == 1)
  }

  async fn apply_status_hint(&self, id: Uuid, hint: &StatusHint) -> Result<()> {
    let to_running = hint.status == Some(TaskStatus::Running);
    let done = sqlx::query(
      "UPDATE tasks SET
         status = CASE WHEN $2 THEN 'running' ELSE status END,
         error = COALESCE($3, error),
         updated_at = NOW()
       WHERE id = $1 AND status NOT IN ('completed', 'failed')",
    )
      .bind(id)
      .bind(to_running)
      .bind(hint.error.as_deref())
      .execute(&self.pool)
      .await
      .with_context(|| format!("Failed to apply status hint to task {}", id))?;
    // Terminal tasks ignore hints; only a missing task is an error.
    if done.rows_affected() == 0 && !self.task_exists(id).await? {
      bail!("Task {} not found", id);
    }
    Ok(())
  }

  async fn store_result(&self, id: Uuid, result: &Value) -> Result<()> {
    let done = sqlx::query("UPDATE tasks SET result = $2, updated_at = NOW() WHERE id = $1")
      .bind(id)
      .bind(result)
      .execute(&self.pool)
      .await
      .with_context(|| format!("Failed to store result of task {}", id))?;
    if done.rows_affected() == 0 {
      bail!("Task {} not found", id);
    }
    Ok(())
  }

  async fn finalize(&self, id: Uuid, outcome: &TaskOutcome) -> Result<bool> {
    let done = sqlx::query(
      "UPDATE tasks SET status = $2, error = $3, end_at = NOW(), updated_at = NOW()
       WHERE id = $1 AND status NOT IN ('completed', 'failed')",
    )
      .bind(id)
      .bind(outcome.status().as_str())
      .bind(outcome.error())
      .execute(&self.pool)
      .await
      .with_context(|| format!("Failed to finalize task {}", id))?;
    if done.rows_affected() == 1 {
      return Ok(true);
    }
    if !self.task_exists(id).await? {
      bail!("Task {} not found", id);
    }
    Ok(false)
  }
}

#[async_trait]
impl LogSink for PgStore {
  async fn append(&self, record: NewLogRecord) -> Result<i64> {
    let row = sqlx::query(
      "INSERT INTO logs
         (timestamp, observed_timestamp, trace_id, span_id, severity_text, severity_number, body, resource, attributes)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
       RETURNING id",
    )
      .bind(record.timestamp)
      .bind(record.observed_timestamp)
      .bind(record.trace_id)
      .bind(&record.span_id)
      .bind(&record.severity_text)
      .bind(record.severity_number)
      .bind(&record.body)
      .bind(&record.resource)
      .bind(&record.attributes)
      .fetch_one(&self.pool)
      .await
      .with_context(|| format!("Failed to insert log for task {}", record.trace_id))?;
    Ok(row.try_get("id")?)
  }

  async fn logs_for_task(&self, trace_id: Uuid) -> Result<Vec<LogRecord>> {
    let rows = sqlx::query(
      "SELECT id, timestamp, observed_timestamp, trace_id, span_id, severity_text, severity_number,
              body, resource, attributes, created_at
       FROM logs
       WHERE trace_id = $1
       ORDER BY timestamp, id",
    )
      .bind(trace_id)
      .fetch_all(&self.pool)
      .await
      .with_context(|| format!("Failed to load logs of task {}", trace_id))?;
    rows.iter().map(log_from_row).collect()
  }
}
