//! Persistence seams used by the engine.
//!
//! [`TaskStore`] owns the task row and [`LogSink`] appends structured log
//! records. Both are implemented for Postgres ([`PgStore`]) and in memory
//! ([`MemoryStore`]).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{LogRecord, NewLogRecord, StatusHint, Task, TaskOutcome};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn insert_task(&self, task: &Task) -> Result<()>;

  async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;

  /// Moves a pending task to running. Returns `false` when the task does not
  /// exist or already reached a terminal status.
  async fn mark_running(&self, id: Uuid) -> Result<bool>;

  /// Applies a worker status report. Never writes a terminal status.
  async fn apply_status_hint(&self, id: Uuid, hint: &StatusHint) -> Result<()>;

  /// Replaces the stored result.
  async fn store_result(&self, id: Uuid, result: &Value) -> Result<()>;

  /// Writes the terminal status. Returns `false` when the task was already
  /// terminal, in which case nothing is changed.
  async fn finalize(&self, id: Uuid, outcome: &TaskOutcome) -> Result<bool>;
}

#[async_trait]
pub trait LogSink: Send + Sync {
  async fn append(&self, record: NewLogRecord) -> Result<i64>;

  /// Records of one task ordered by worker timestamp, then insertion order.
  async fn logs_for_task(&self, trace_id: Uuid) -> Result<Vec<LogRecord>>;
}
