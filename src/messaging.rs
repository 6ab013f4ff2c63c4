use lapin::{Connection, ConnectionProperties, Channel, options::{BasicPublishOptions, QueueDeclareOptions}, types::FieldTable, BasicProperties};
use serde::{Deserialize, Serialize};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;
use anyhow::Result;
use uuid::Uuid;

pub const TASK_QUEUE: &str = "task_queue";

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

/// Queue message announcing a pending task. The task row is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
  pub task_id: Uuid,
  pub priority: i32,
}

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn declare_task_queue(channel: &Channel) -> Result<()> {
  channel
    .queue_declare(TASK_QUEUE, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
    .await?;
  Ok(())
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel.basic_publish("", queue, BasicPublishOptions::default(), payload, BasicProperties::default()).await
  })
    .await?;
  Ok(())
}

pub async fn publish_task(channel: &Channel, message: &TaskMessage) -> Result<()> {
  let payload = serde_json::to_vec(message)?;
  publish_message(channel, TASK_QUEUE, &payload).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn task_message_wire_format() {
    let message = TaskMessage { task_id: Uuid::nil(), priority: 2 };
    let encoded = serde_json::to_value(&message).unwrap();
    assert_eq!(encoded, serde_json::json!({"task_id": "00000000-0000-0000-0000-000000000000", "priority": 2}));
    let decoded: TaskMessage = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, message);
  }
}
