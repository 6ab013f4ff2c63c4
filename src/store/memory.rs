use std::collections::HashMap;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{LogRecord, NewLogRecord, StatusHint, Task, TaskOutcome, TaskStatus};
use crate::store::{LogSink, TaskStore};

/// Process-local store with the same row semantics as [`super::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
  tasks: Mutex<HashMap<Uuid, Task>>,
  logs: Mutex<Vec<LogRecord>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn log_count(&self) -> usize {
    self.logs.lock().await.len()
  }
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn insert_task(&self, task: &Task) -> Result<()> {
    let mut tasks = self.tasks.lock().await;
    if tasks.contains_key(&task.id) {
      bail!("Task {} already exists", task.id);
    }
    tasks.insert(task.id, task.clone());
    Ok(())
  }

  async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
    Ok(self.tasks.lock().await.get(&id).cloned())
  }

  async fn mark_running(&self, id: Uuid) -> Result<bool> {
    let mut tasks = self.tasks.lock().await;
    match tasks.get_mut(&id) {
      Some(task) if !task.status.is_terminal() => {
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at.get_or_insert(now);
        task.updated_at = now;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  async fn apply_status_hint(&self, id: Uuid, hint: &StatusHint) -> Result<()> {
    let mut tasks = self.tasks.lock().await;
    let Some(task) = tasks.get_mut(&id) else {
      bail!("Task {} not found", id);
    };
    if task.status.is_terminal() {
      return Ok(());
    }
    if hint.status == Some(TaskStatus::Running) {
      task.status = TaskStatus::Running;
    }
    if let Some(error) = &hint.error {
      task.error = Some(error.clone());
    }
    task.updated_at = Utc::now();
    Ok(())
  }

  async fn store_result(&self, id: Uuid, result: &Value) -> Result<()> {
    let mut tasks = self.tasks.lock().await;
    let Some(task) = tasks.get_mut(&id) else {
      bail!("Task {} not found", id);
    };
    task.result = Some(result.clone());
    task.updated_at = Utc::now();
    Ok(())
  }

  async fn finalize(&self, id: Uuid, outcome: &TaskOutcome) -> Result<bool> {
    let mut tasks = self.tasks.lock().await;
    let Some(task) = tasks.get_mut(&id) else {
      bail!("Task {} not found", id);
    };
    if task.status.is_terminal() {
      return Ok(false);
    }
    let now = Utc::now();
    task.status = outcome.status();
    task.error = outcome.error().map(str::to_string);
    task.end_at = Some(now);
    task.updated_at = now;
    Ok(true)
  }
}

#[async_trait]
impl LogSink for MemoryStore {
  async fn append(&self, record: NewLogRecord) -> Result<i64> {
    let mut logs = self.logs.lock().await;
    let id = logs.len() as i64 + 1;
    logs.push(LogRecord {
      id,
      timestamp: record.timestamp,
      observed_timestamp: record.observed_timestamp,
      trace_id: record.trace_id,
      span_id: record.span_id,
      severity_text: record.severity_text,
      severity_number: record.severity_number,
      body: record.body,
      resource: record.resource,
      attributes: record.attributes,
      created_at: Utc::now(),
    });
    Ok(id)
  }

  async fn logs_for_task(&self, trace_id: Uuid) -> Result<Vec<LogRecord>> {
    let mut records: Vec<LogRecord> = self.logs.lock().await
      .iter()
      .filter(|r| r.trace_id == trace_id)
      .cloned()
      .collect();
    records.sort_by_key(|r| (r.timestamp, r.id));
    Ok(records)
  }
}
