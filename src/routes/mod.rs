use std::convert::Infallible;
use std::sync::Arc;
use warp::Filter;
use warp::http::StatusCode;
use lapin::Channel;
use serde_json::json;
use tracing::error;
use crate::store::PgStore;

pub mod tasks;
pub mod sse;

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl warp::reject::Reject for ApiError {}

pub fn reject(status: StatusCode, message: impl Into<String>) -> warp::Rejection {
  warp::reject::custom(ApiError { status, message: message.into() })
}

pub fn with_store(store: Arc<PgStore>) -> impl Filter<Extract = (Arc<PgStore>,), Error = Infallible> + Clone {
  warp::any().map(move || store.clone())
}

pub fn routes(
  store: Arc<PgStore>,
  rabbit_channel: Channel
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  tasks::submit_route(store.clone(), rabbit_channel)
    .or(tasks::logs_route(store.clone()))
    .or(tasks::task_route(store.clone()))
    .or(sse::sse_route(store))
    .recover(handle_rejection)
}

async fn handle_rejection(rejection: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(e) = rejection.find::<ApiError>() {
    (e.status, e.message.clone())
  } else if rejection.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else if let Some(e) = rejection.find::<warp::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else {
    error!("Unhandled rejection: {:?}", rejection);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({"error": message})), status))
}
