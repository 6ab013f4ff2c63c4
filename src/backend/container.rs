use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::info;

use crate::backend::{spawn_worker, ExecutionBackend, LaunchRequest, WorkerProcess};
use crate::error::ExecError;
use crate::paths::PathTranslator;

/// Runs workers inside a long-lived container via `docker exec -i`.
///
/// Paths in the payload, the worker script and the working directory are
/// rewritten into the container's namespace before anything is started.
pub struct ContainerBackend {
  docker: String,
  container: String,
  interpreter: String,
  translator: PathTranslator,
  ready: OnceCell<()>,
}

impl ContainerBackend {
  pub fn new(
    docker: impl Into<String>,
    container: impl Into<String>,
    interpreter: impl Into<String>,
    translator: PathTranslator,
  ) -> Self {
    Self {
      docker: docker.into(),
      container: container.into(),
      interpreter: interpreter.into(),
      translator,
      ready: OnceCell::new(),
    }
  }

  /// Concurrent callers share one in-flight check; only success is cached.
  async fn ensure_ready(&self) -> Result<(), ExecError> {
    self.ready.get_or_try_init(|| self.probe_container()).await?;
    Ok(())
  }

  async fn probe_container(&self) -> Result<(), ExecError> {
    let not_ready = |reason: String| ExecError::ContainerNotReady {
      container: self.container.clone(),
      reason,
    };
    let output = Command::new(&self.docker)
      .args(["inspect", "--format", "{{.State.Running}}", &self.container])
      .output()
      .await
      .map_err(|e| not_ready(format!("failed to run '{}': {}", self.docker, e)))?;
    if !output.status.success() {
      return Err(not_ready(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }
    if String::from_utf8_lossy(&output.stdout).trim() != "true" {
      return Err(not_ready("container is not running".into()));
    }
    info!(container = %self.container, "Worker container is running");
    Ok(())
  }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
  fn name(&self) -> &'static str {
    "docker"
  }

  async fn launch(&self, request: LaunchRequest) -> Result<WorkerProcess, ExecError> {
    let payload = self.translator.translate_payload(&request.payload)?;
    let worker_path = self.translator.to_container(&request.worker_path)?;
    let working_dir = self.translator.to_container(&request.working_dir)?;

    self.ensure_ready().await?;

    info!(
      container = %self.container,
      worker = %worker_path,
      "Launching containerized worker"
    );
    let mut command = Command::new(&self.docker);
    command
      .args(["exec", "-i", "-w", &working_dir, &self.container])
      .arg(&self.interpreter)
      .arg(&worker_path);
    spawn_worker(command, &self.docker, &payload)
  }
}
