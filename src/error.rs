use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExecError {
  #[error("failed to launch worker: {0}")]
  Launch(String),

  #[error("path '{path}' is outside the project root '{root}'")]
  PathOutsideRoot { path: String, root: String },

  #[error("container '{container}' is not ready: {reason}")]
  ContainerNotReady { container: String, reason: String },

  #[error("task {0} is missing or already finished")]
  NotRunnable(Uuid),

  #[error("failed to persist task state: {0:#}")]
  Persistence(#[from] anyhow::Error),
}
