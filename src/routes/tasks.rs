use std::sync::{Arc, LazyLock};
use warp::Filter;
use warp::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use lapin::Channel;
use tracing::{info, error};
use regex::Regex;
use crate::messaging::{publish_task, TaskMessage};
use crate::models::{Task, TaskType};
use crate::routes::{reject, with_store};
use crate::store::{LogSink, PgStore, TaskStore};

const DEFAULT_PRIORITY: i32 = 5;

static MODEL_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w.\-]+$").expect("model name pattern"));
static COLUMN_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w\s.,()%/\-]+$").expect("column name pattern"));

#[derive(Deserialize)]
pub struct NewTask {
  pub task_type: TaskType,
  pub parameter: Value,
  pub priority: Option<i32>,
}

#[derive(Serialize)]
pub struct TaskResponse {
  pub task_id: Uuid,
  pub status: String,
  pub sse_url: String,
}

fn require_str<'a>(parameter: &'a Value, field: &str) -> Result<&'a str, String> {
  match parameter.get(field) {
    Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
    Some(_) => Err(format!("Field '{}' must be a non-empty string", field)),
    None => Err(format!("Missing field '{}'", field)),
  }
}

fn require_list<'a>(parameter: &'a Value, field: &str, pattern: &Regex) -> Result<Vec<&'a str>, String> {
  let items = parameter.get(field)
    .and_then(Value::as_array)
    .filter(|items| !items.is_empty())
    .ok_or_else(|| format!("Field '{}' must be a non-empty list", field))?;
  items.iter()
    .map(|item| match item.as_str() {
      Some(s) if pattern.is_match(s) => Ok(s),
      _ => Err(format!("Invalid or unsafe entry in '{}'", field)),
    })
    .collect()
}

fn require_match(parameter: &Value, field: &str, pattern: &Regex) -> Result<(), String> {
  if pattern.is_match(require_str(parameter, field)?) {
    Ok(())
  } else {
    Err(format!("Invalid or unsafe value for field '{}'", field))
  }
}

pub fn validate_parameter(task_type: TaskType, parameter: &Value) -> Result<(), String> {
  if !parameter.is_object() {
    return Err("Parameter must be a JSON object".into());
  }
  match task_type {
    TaskType::Tuning | TaskType::Training => {
      require_str(parameter, "inputFile")?;
      require_match(parameter, "model", &MODEL_NAME)?;
    },
    TaskType::Prediction => {
      for field in &["trainingDataPath", "predictionDataPath", "outputPath"] {
        require_str(parameter, field)?;
      }
      require_match(parameter, "model", &MODEL_NAME)?;
      if parameter.get("params").is_some_and(|p| !p.is_object()) {
        return Err("Field 'params' must be an object".into());
      }
    },
  }
  require_list(parameter, "featureColumns", &COLUMN_NAME)?;
  require_match(parameter, "targetColumn", &COLUMN_NAME)?;
  Ok(())
}

pub fn submit_route(store: Arc<PgStore>, rabbit_channel: Channel) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("submit")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_store(store))
    .and(with_channel(rabbit_channel))
    .and_then(handle_submit_task)
}

pub fn task_route(store: Arc<PgStore>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::get())
    .and(with_store(store))
    .and_then(handle_get_task)
}

pub fn logs_route(store: Arc<PgStore>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid / "logs")
    .and(warp::get())
    .and(with_store(store))
    .and_then(handle_get_logs)
}

fn with_channel(channel: Channel) -> impl Filter<Extract = (Channel,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || channel.clone())
}

async fn handle_submit_task(new_task: NewTask, store: Arc<PgStore>, channel: Channel) -> Result<impl warp::Reply, warp::Rejection> {
  if let Err(e) = validate_parameter(new_task.task_type, &new_task.parameter) {
    error!("Parameter validation failed: {}", e);
    return Err(reject(StatusCode::BAD_REQUEST, e));
  }

  let task = Task::new(new_task.task_type, new_task.parameter, new_task.priority.unwrap_or(DEFAULT_PRIORITY));
  store.insert_task(&task).await.map_err(|e| {
    error!("DB insertion failed: {:#}", e);
    reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to store task.")
  })?;

  let message = TaskMessage { task_id: task.id, priority: task.priority };
  publish_task(&channel, &message).await.map_err(|e| {
    error!("Failed to publish task {}: {:?}", task.id, e);
    reject(StatusCode::INTERNAL_SERVER_ERROR, "An error occurred when publishing task.")
  })?;

  info!(task_id = %task.id, task_type = %task.task_type, "Task submitted");
  let response = TaskResponse {
    task_id: task.id,
    status: "submitted".into(),
    sse_url: format!("/sse?task_id={}", task.id),
  };
  Ok(warp::reply::json(&response))
}

async fn handle_get_task(task_id: Uuid, store: Arc<PgStore>) -> Result<impl warp::Reply, warp::Rejection> {
  let task = store.get_task(task_id).await.map_err(|e| {
    error!("Failed to load task {}: {:#}", task_id, e);
    reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load task.")
  })?;
  match task {
    Some(task) => Ok(warp::reply::json(&task)),
    None => Err(reject(StatusCode::NOT_FOUND, format!("Task {} not found", task_id))),
  }
}

async fn handle_get_logs(task_id: Uuid, store: Arc<PgStore>) -> Result<impl warp::Reply, warp::Rejection> {
  let logs = store.logs_for_task(task_id).await.map_err(|e| {
    error!("Failed to load logs of task {}: {:#}", task_id, e);
    reject(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load logs.")
  })?;
  Ok(warp::reply::json(&logs))
}
