use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use futures::stream;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use warp::Filter;
use warp::http::StatusCode;
use serde_json::json;
use tracing::error;
use uuid::Uuid;
use crate::routes::{reject, with_store};
use crate::store::{PgStore, TaskStore};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn sse_route(store: Arc<PgStore>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::path::end())
    .and(warp::get())
    .and(warp::query::<HashMap<String, String>>())
    .and(with_store(store))
    .and_then(handle_sse)
}

async fn handle_sse(query: HashMap<String, String>, store: Arc<PgStore>) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query.get("task_id")
    .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "Missing task_id"))?;
  let task_id = Uuid::parse_str(task_id)
    .map_err(|_| reject(StatusCode::BAD_REQUEST, "Invalid task_id"))?;

  let ticks = IntervalStream::new(tokio::time::interval(POLL_INTERVAL));
  // Stops after the first terminal status has been sent.
  let events = stream::unfold((ticks, false), move |(mut ticks, finished)| {
    let store = store.clone();
    async move {
      if finished {
        return None;
      }
      ticks.next().await?;
      let (event, finished) = match store.get_task(task_id).await {
        Ok(Some(task)) => {
          let data = json!({"task_id": task_id, "status": task.status, "error": task.error});
          (Some(warp::sse::Event::default().data(data.to_string())), task.status.is_terminal())
        }
        Ok(None) => (None, true),
        Err(e) => {
          error!("Error fetching task status: {:#}", e);
          (None, false)
        }
      };
      Some((event, (ticks, finished)))
    }
  })
    .filter_map(|event| event.map(Ok::<_, Infallible>));

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(events)))
}
