use lapin::{options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions}, types::FieldTable, message::Delivery};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn, error};
use tracing_subscriber::EnvFilter;
use futures_lite::StreamExt;
use anyhow::{Context, Result};
use mlexec::backend::build_backend;
use mlexec::config::Config;
use mlexec::database::setup_database;
use mlexec::error::ExecError;
use mlexec::executor::TaskExecutor;
use mlexec::messaging::{create_rabbit_channel, declare_task_queue, TaskMessage, TASK_QUEUE};
use mlexec::store::{PgStore, TaskStore};
use mlexec::worker_scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url, config.worker_concurrency as u32 + 2).await?;
  let store = Arc::new(PgStore::new(db_pool));
  let backend = build_backend(&config);
  let executor = Arc::new(TaskExecutor::new(
    backend,
    store.clone(),
    store.clone(),
    config.worker_dir.clone(),
    config.project_root.clone(),
  ));

  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .context("Failed to create RabbitMQ channel")?;
  declare_task_queue(&rabbit_channel).await?;
  let mut consumer = rabbit_channel
    .basic_consume(TASK_QUEUE, &config.worker_id, BasicConsumeOptions::default(), FieldTable::default())
    .await
    .context("Failed to start consumer")?;
  info!(worker_id = %config.worker_id, mode = ?config.execution_mode, "Worker consuming {}", TASK_QUEUE);

  let scheduler: Arc<Scheduler<(TaskMessage, Delivery)>> = Arc::new(Scheduler::new());
  let semaphore = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));

  let scheduler_consumer = scheduler.clone();
  tokio::spawn(async move {
    while let Some(delivery) = consumer.next().await {
      match delivery {
        Ok(delivery) => {
          match serde_json::from_slice::<TaskMessage>(&delivery.data) {
            Ok(message) => {
              scheduler_consumer.add_task(message.priority, (message, delivery)).await;
            }
            Err(e) => {
              error!("Failed to parse task message: {:?}", e);
              let _ = delivery.ack(BasicAckOptions::default()).await;
            }
          }
        }
        Err(e) => error!("Consumer error: {:?}", e),
      }
    }
    warn!("Task queue consumer stopped");
  });

  loop {
    let (permit, scheduled) = scheduler.next_with_permit(semaphore.clone()).await?;
    let executor = executor.clone();
    let store = store.clone();
    tokio::spawn(async move {
      let (message, delivery) = scheduled.item;
      process_delivery(&executor, store.as_ref(), &message, &delivery).await;
      drop(permit);
    });
  }
}

async fn process_delivery(executor: &TaskExecutor, store: &dyn TaskStore, message: &TaskMessage, delivery: &Delivery) {
  let task_id = message.task_id;
  let task = match store.get_task(task_id).await {
    Ok(Some(task)) => task,
    Ok(None) => {
      warn!(task_id = %task_id, "Queued task does not exist");
      let _ = delivery.ack(BasicAckOptions::default()).await;
      return;
    }
    Err(e) => {
      error!(task_id = %task_id, "Failed to load task: {:#}", e);
      let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
      return;
    }
  };

  match executor.run(&task).await {
    Ok(outcome) => {
      info!(task_id = %task_id, status = %outcome.status(), "Task processed");
      let _ = delivery.ack(BasicAckOptions::default()).await;
    }
    Err(ExecError::NotRunnable(_)) => {
      warn!(task_id = %task_id, "Task already finished, dropping delivery");
      let _ = delivery.ack(BasicAckOptions::default()).await;
    }
    Err(e) => {
      error!(task_id = %task_id, "Task processing failed: {}", e);
      let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
    }
  }
}
