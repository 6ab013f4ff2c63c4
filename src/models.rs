use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Running,
  Completed,
  Failed,
}

impl TaskStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Running => "running",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "pending" => Ok(TaskStatus::Pending),
      "running" => Ok(TaskStatus::Running),
      "completed" => Ok(TaskStatus::Completed),
      "failed" => Ok(TaskStatus::Failed),
      other => Err(anyhow::anyhow!("Unknown task status: {}", other)),
    }
  }
}

/// Kind of work a task performs. Each kind maps onto a stdin-driven worker script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
  Tuning,
  Training,
  Prediction,
}

impl TaskType {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskType::Tuning => "tuning",
      TaskType::Training => "training",
      TaskType::Prediction => "prediction",
    }
  }

  pub fn worker_script(&self) -> &'static str {
    match self {
      TaskType::Tuning | TaskType::Training => "tune_model.py",
      TaskType::Prediction => "predict.py",
    }
  }
}

impl fmt::Display for TaskType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskType {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "tuning" => Ok(TaskType::Tuning),
      "training" => Ok(TaskType::Training),
      "prediction" => Ok(TaskType::Prediction),
      other => Err(anyhow::anyhow!("Unknown task type: {}", other)),
    }
  }
}

/// One unit of work. `parameter` is fed to the worker verbatim and `result`
/// holds whatever the worker last reported; neither is interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub id: Uuid,
  pub task_type: TaskType,
  pub status: TaskStatus,
  pub parameter: serde_json::Value,
  pub result: Option<serde_json::Value>,
  pub error: Option<String>,
  pub priority: i32,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub end_at: Option<DateTime<Utc>>,
  pub updated_at: DateTime<Utc>,
}

impl Task {
  pub fn new(task_type: TaskType, parameter: serde_json::Value, priority: i32) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      task_type,
      status: TaskStatus::Pending,
      parameter,
      result: None,
      error: None,
      priority,
      created_at: now,
      started_at: None,
      end_at: None,
      updated_at: now,
    }
  }
}

/// The single terminal transition of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
  Completed,
  Failed(String),
}

impl TaskOutcome {
  pub fn status(&self) -> TaskStatus {
    match self {
      TaskOutcome::Completed => TaskStatus::Completed,
      TaskOutcome::Failed(_) => TaskStatus::Failed,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      TaskOutcome::Completed => None,
      TaskOutcome::Failed(message) => Some(message),
    }
  }
}

/// Non-authoritative status report sent by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusHint {
  pub status: Option<TaskStatus>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
  pub id: i64,
  pub timestamp: i64,
  pub observed_timestamp: i64,
  pub trace_id: Uuid,
  pub span_id: Option<String>,
  pub severity_text: String,
  pub severity_number: i32,
  pub body: String,
  pub resource: serde_json::Value,
  pub attributes: serde_json::Value,
  pub created_at: DateTime<Utc>,
}

/// A log record before the store assigns its id and creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogRecord {
  pub timestamp: i64,
  pub observed_timestamp: i64,
  pub trace_id: Uuid,
  pub span_id: Option<String>,
  pub severity_text: String,
  pub severity_number: i32,
  pub body: String,
  pub resource: serde_json::Value,
  pub attributes: serde_json::Value,
}
