use std::sync::Arc;
use warp::Filter;
use tracing_subscriber::EnvFilter;
use anyhow::{Context, Result};
use mlexec::{config::Config, database::setup_database, messaging::{create_rabbit_channel, declare_task_queue}, routes::routes, store::PgStore};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url, 10).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .context("Failed to create RabbitMQ channel")?;
  declare_task_queue(&rabbit_channel).await?;

  let api = routes(Arc::new(PgStore::new(db_pool)), rabbit_channel)
    .with(warp::trace::request());

  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
