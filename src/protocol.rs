//! Worker output protocol.
//!
//! Every line a worker prints is either a JSON envelope `{"type": ..., "data": ...}`
//! or free text. Envelopes are persisted, free text only goes to the
//! operational log.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{NewLogRecord, StatusHint};
use crate::store::{LogSink, TaskStore};
use crate::stream::{StreamKind, StreamLine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
  Result,
  Prediction,
  Comparison,
}

impl ResultKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResultKind::Result => "result",
      ResultKind::Prediction => "prediction_result",
      ResultKind::Comparison => "comparison_result",
    }
  }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogData {
  pub timestamp: Option<Value>,
  pub observed_timestamp: Option<Value>,
  pub severity_text: Option<String>,
  pub severity_number: Option<i32>,
  pub body: Option<Value>,
  pub span_id: Option<String>,
  pub resource: Option<Value>,
  pub attributes: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusData {
  pub status: Option<String>,
  pub error: Option<String>,
}

#[derive(Debug)]
pub enum Envelope {
  Log(LogData),
  Status(StatusData),
  Result { kind: ResultKind, data: Value },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
  #[error("not a JSON document")]
  NotJson,
  #[error("JSON value is not an object")]
  NotObject,
  #[error("envelope has no string `type`")]
  MissingType,
  #[error("unknown envelope type `{0}`")]
  UnknownType(String),
  #[error("malformed `{kind}` payload: {reason}")]
  BadData { kind: &'static str, reason: String },
}

pub fn parse_envelope(line: &str) -> Result<Envelope, ProtocolError> {
  let value: Value = serde_json::from_str(line).map_err(|_| ProtocolError::NotJson)?;
  let Value::Object(mut object) = value else {
    return Err(ProtocolError::NotObject);
  };
  let kind = match object.get("type") {
    Some(Value::String(kind)) => kind.clone(),
    _ => return Err(ProtocolError::MissingType),
  };
  let data = object.remove("data").unwrap_or(Value::Null);

  match kind.as_str() {
    "log" => decode("log", data).map(Envelope::Log),
    "status" => decode("status", data).map(Envelope::Status),
    "result" => result_envelope(ResultKind::Result, data),
    "prediction_result" => result_envelope(ResultKind::Prediction, data),
    "comparison_result" => result_envelope(ResultKind::Comparison, data),
    _ => Err(ProtocolError::UnknownType(kind)),
  }
}

fn decode<T: for<'de> Deserialize<'de>>(kind: &'static str, data: Value) -> Result<T, ProtocolError> {
  serde_json::from_value(data).map_err(|e| ProtocolError::BadData { kind, reason: e.to_string() })
}

fn result_envelope(kind: ResultKind, data: Value) -> Result<Envelope, ProtocolError> {
  if data.is_null() {
    return Err(ProtocolError::BadData { kind: kind.as_str(), reason: "missing `data`".into() });
  }
  Ok(Envelope::Result { kind, data })
}

/// OpenTelemetry-style severity number for a worker severity name.
pub fn severity_number_for(text: &str) -> i32 {
  match text.trim().to_ascii_uppercase().as_str() {
    "DEBUG" => 1,
    "INFO" => 9,
    "WARN" | "WARNING" => 13,
    "ERROR" => 17,
    "CRITICAL" | "FATAL" => 21,
    _ => 0,
  }
}

pub fn severity_text_for(number: i32) -> &'static str {
  match number {
    1..=8 => "DEBUG",
    9..=12 => "INFO",
    13..=16 => "WARNING",
    17..=20 => "ERROR",
    21..=24 => "CRITICAL",
    _ => "UNKNOWN",
  }
}

fn now_nanos() -> i64 {
  Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn as_nanos(value: &Value) -> Option<i64> {
  value.as_i64()
    .or_else(|| value.as_u64().and_then(|v| i64::try_from(v).ok()))
    .or_else(|| value.as_f64().map(|v| v as i64))
}

fn as_object(value: Option<Value>) -> Value {
  match value {
    Some(Value::Object(map)) => Value::Object(map),
    _ => Value::Object(Map::new()),
  }
}

impl LogData {
  pub fn into_record(self, trace_id: Uuid) -> NewLogRecord {
    let observed_timestamp = now_nanos();
    let timestamp = self.timestamp.as_ref().and_then(as_nanos).unwrap_or(observed_timestamp);
    let (severity_text, severity_number) = match (self.severity_text, self.severity_number) {
      (Some(text), Some(number)) => (text, number),
      (Some(text), None) => {
        let number = severity_number_for(&text);
        (text, number)
      }
      (None, Some(number)) => (severity_text_for(number).to_string(), number),
      (None, None) => ("UNKNOWN".to_string(), 0),
    };
    let body = match self.body {
      Some(Value::String(body)) => body,
      Some(Value::Null) | None => String::new(),
      Some(other) => other.to_string(),
    };
    NewLogRecord {
      timestamp,
      observed_timestamp,
      trace_id,
      span_id: self.span_id,
      severity_text,
      severity_number,
      body,
      resource: as_object(self.resource),
      attributes: as_object(self.attributes),
    }
  }
}

impl StatusData {
  pub fn into_hint(self) -> StatusHint {
    StatusHint {
      status: self.status.as_deref().and_then(|s| s.parse().ok()),
      error: self.error.filter(|e| !e.trim().is_empty()),
    }
  }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
  pub logs: usize,
  pub results: usize,
  pub status_hints: usize,
  pub unstructured: usize,
  pub persistence_failures: usize,
}

/// Routes one task's output lines to persistence. Never fails: anything that
/// cannot be stored is logged and dropped.
pub struct ProtocolDispatcher {
  task_id: Uuid,
  tasks: Arc<dyn TaskStore>,
  logs: Arc<dyn LogSink>,
  stats: DispatchStats,
}

impl ProtocolDispatcher {
  pub fn new(task_id: Uuid, tasks: Arc<dyn TaskStore>, logs: Arc<dyn LogSink>) -> Self {
    Self { task_id, tasks, logs, stats: DispatchStats::default() }
  }

  pub fn stats(&self) -> DispatchStats {
    self.stats
  }

  pub async fn dispatch(&mut self, line: &StreamLine) {
    let text = line.text.trim();
    if text.is_empty() {
      return;
    }
    match parse_envelope(text) {
      Ok(envelope) => self.route(envelope).await,
      Err(e) => {
        self.stats.unstructured += 1;
        debug!(task_id = %self.task_id, stream = line.stream.as_str(), "Unstructured worker output: {}", e);
        match line.stream {
          StreamKind::Stdout => info!(target: "worker", task_id = %self.task_id, "{}", text),
          StreamKind::Stderr => warn!(target: "worker", task_id = %self.task_id, "{}", text),
        }
      }
    }
  }

  async fn route(&mut self, envelope: Envelope) {
    let task_id = self.task_id;
    let stored = match envelope {
      Envelope::Log(data) => {
        self.stats.logs += 1;
        self.logs.append(data.into_record(task_id)).await.map(|_| ())
      }
      Envelope::Status(data) => {
        self.stats.status_hints += 1;
        let hint = data.into_hint();
        debug!(task_id = %task_id, status = ?hint.status, "Worker reported status");
        self.tasks.apply_status_hint(task_id, &hint).await
      }
      Envelope::Result { kind, data } => {
        self.stats.results += 1;
        info!(task_id = %task_id, kind = kind.as_str(), "Worker reported result");
        self.tasks.store_result(task_id, &data).await
      }
    };
    if let Err(e) = stored {
      self.stats.persistence_failures += 1;
      error!(task_id = %task_id, "Failed to persist worker envelope: {:#}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Task, TaskStatus, TaskType};
  use crate::store::MemoryStore;
  use serde_json::json;

  fn stdout(text: &str) -> StreamLine {
    StreamLine { stream: StreamKind::Stdout, text: text.to_string() }
  }

  async fn setup() -> (Arc<MemoryStore>, ProtocolDispatcher, Uuid) {
    let store = Arc::new(MemoryStore::new());
    let task = Task::new(TaskType::Tuning, json!({}), 5);
    store.insert_task(&task).await.unwrap();
    store.mark_running(task.id).await.unwrap();
    let dispatcher = ProtocolDispatcher::new(task.id, store.clone(), store.clone());
    (store, dispatcher, task.id)
  }

  #[test]
  fn classifies_envelopes() {
    assert!(matches!(parse_envelope("not json at all"), Err(ProtocolError::NotJson)));
    assert!(matches!(parse_envelope("[1, 2]"), Err(ProtocolError::NotObject)));
    assert!(matches!(parse_envelope(r#"{"data": {}}"#), Err(ProtocolError::MissingType)));
    assert!(matches!(parse_envelope(r#"{"type": "progress", "data": {}}"#), Err(ProtocolError::UnknownType(t)) if t == "progress"));
    assert!(matches!(parse_envelope(r#"{"type": "result"}"#), Err(ProtocolError::BadData { kind: "result", .. })));
    assert!(matches!(parse_envelope(r#"{"type": "log", "data": {"severity_number": "high"}}"#), Err(ProtocolError::BadData { kind: "log", .. })));
    assert!(matches!(
      parse_envelope(r#"{"type": "prediction_result", "data": {"num_predictions": 3}}"#),
      Ok(Envelope::Result { kind: ResultKind::Prediction, .. })
    ));
  }

  #[test]
  fn severity_number_is_derived_from_text() {
    let record = LogData {
      severity_text: Some("warning".into()),
      body: Some(json!("disk almost full")),
      timestamp: Some(json!(1_700_000_000_123_456_789_i64)),
      ..Default::default()
    }.into_record(Uuid::nil());
    assert_eq!(record.severity_number, 13);
    assert_eq!(record.timestamp, 1_700_000_000_123_456_789);
    assert_eq!(record.body, "disk almost full");
    assert_eq!(record.resource, json!({}));

    let record = LogData { severity_number: Some(17), ..Default::default() }.into_record(Uuid::nil());
    assert_eq!(record.severity_text, "ERROR");
    assert_eq!(record.timestamp, record.observed_timestamp);
  }

  #[tokio::test]
  async fn log_envelope_is_persisted_with_trace_id() {
    let (store, mut dispatcher, task_id) = setup().await;
    dispatcher.dispatch(&stdout(r#"{"type":"log","data":{"severity_text":"INFO","body":"starting","attributes":{"logger_name":"tune"}}}"#)).await;

    let logs = store.logs_for_task(task_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].trace_id, task_id);
    assert_eq!(logs[0].severity_number, 9);
    assert_eq!(logs[0].body, "starting");
    assert_eq!(logs[0].attributes, json!({"logger_name": "tune"}));
    assert_eq!(dispatcher.stats().logs, 1);
  }

  #[tokio::test]
  async fn unstructured_lines_are_not_persisted() {
    let (store, mut dispatcher, task_id) = setup().await;
    dispatcher.dispatch(&stdout("not json at all")).await;
    dispatcher.dispatch(&StreamLine { stream: StreamKind::Stderr, text: "Warning: XGBoost not available".into() }).await;
    dispatcher.dispatch(&stdout("   ")).await;

    assert_eq!(store.log_count().await, 0);
    let task = store.get_task(task_id).await.unwrap().unwrap();
    assert!(task.result.is_none());
    assert_eq!(dispatcher.stats().unstructured, 2);
  }

  #[tokio::test]
  async fn last_result_envelope_wins() {
    let (store, mut dispatcher, task_id) = setup().await;
    dispatcher.dispatch(&stdout(r#"{"type":"result","data":{"model":"Lasso"}}"#)).await;
    dispatcher.dispatch(&stdout(r#"{"type":"result","data":{"model":"Ridge"}}"#)).await;

    let task = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.result, Some(json!({"model": "Ridge"})));
    assert_eq!(dispatcher.stats().results, 2);
  }

  #[tokio::test]
  async fn failed_status_report_is_only_a_hint() {
    let (store, mut dispatcher, task_id) = setup().await;
    dispatcher.dispatch(&stdout(r#"{"type":"status","data":{"status":"failed","error":"targetColumn is required"}}"#)).await;

    let task = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.error.as_deref(), Some("targetColumn is required"));
  }

  #[tokio::test]
  async fn persistence_failures_are_swallowed() {
    let store = Arc::new(MemoryStore::new());
    let mut dispatcher = ProtocolDispatcher::new(Uuid::new_v4(), store.clone(), store.clone());
    dispatcher.dispatch(&stdout(r#"{"type":"result","data":{"model":"Ridge"}}"#)).await;
    assert_eq!(dispatcher.stats().persistence_failures, 1);
  }
}
