use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::backend::{spawn_worker, ExecutionBackend, LaunchRequest, WorkerProcess};
use crate::error::ExecError;

/// Runs `<interpreter> <worker_path>` on the host.
#[derive(Debug, Clone)]
pub struct LocalBackend {
  interpreter: String,
}

impl LocalBackend {
  pub fn new(interpreter: impl Into<String>) -> Self {
    Self { interpreter: interpreter.into() }
  }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
  fn name(&self) -> &'static str {
    "local"
  }

  async fn launch(&self, request: LaunchRequest) -> Result<WorkerProcess, ExecError> {
    info!(
      interpreter = %self.interpreter,
      worker = %request.worker_path.display(),
      "Launching local worker"
    );
    let mut command = Command::new(&self.interpreter);
    command.arg(&request.worker_path).current_dir(&request.working_dir);
    spawn_worker(command, &self.interpreter, &request.payload)
  }
}
