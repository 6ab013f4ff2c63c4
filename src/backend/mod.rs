//! Launch strategies for worker processes.
//!
//! A backend turns a [`LaunchRequest`] into a running [`WorkerProcess`]. The
//! local backend runs the worker script directly; the container backend runs
//! it inside an already-running container through `docker exec`.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{Config, ExecutionMode};
use crate::error::ExecError;
use crate::paths::PathTranslator;

pub mod container;
pub mod local;

pub use container::ContainerBackend;
pub use local::LocalBackend;

#[derive(Debug, Clone)]
pub struct LaunchRequest {
  pub worker_path: PathBuf,
  pub payload: Value,
  pub working_dir: PathBuf,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
  LaunchFailed(String),
  Exited(i32),
}

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// A running worker. `signals` yields every terminal trigger the process
/// produces (at most two: a stdin failure and the exit) and closes after that.
pub struct WorkerProcess {
  pub stdout: OutputStream,
  pub stderr: OutputStream,
  pub signals: mpsc::Receiver<Completion>,
}

impl WorkerProcess {
  pub fn new(stdout: OutputStream, stderr: OutputStream, signals: mpsc::Receiver<Completion>) -> Self {
    Self { stdout, stderr, signals }
  }
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
  fn name(&self) -> &'static str;

  async fn launch(&self, request: LaunchRequest) -> Result<WorkerProcess, ExecError>;
}

pub fn build_backend(config: &Config) -> Arc<dyn ExecutionBackend> {
  match config.execution_mode {
    ExecutionMode::Local => Arc::new(LocalBackend::new(&config.python_bin)),
    ExecutionMode::Docker => Arc::new(ContainerBackend::new(
      "docker",
      &config.container_name,
      &config.python_bin,
      PathTranslator::new(&config.project_root, &config.container_root),
    )),
  }
}

/// Spawns `command` with piped stdio, feeds it `payload` and closes stdin.
pub(crate) fn spawn_worker(mut command: Command, program: &str, payload: &Value) -> Result<WorkerProcess, ExecError> {
  let input = serde_json::to_vec(payload)
    .map_err(|e| ExecError::Launch(format!("failed to serialize worker payload: {}", e)))?;

  let mut child = command
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .map_err(|e| ExecError::Launch(format!("failed to start '{}': {}", program, e)))?;

  let (Some(mut stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take()) else {
    return Err(ExecError::Launch(format!("stdio of '{}' was not captured", program)));
  };

  let (signal_tx, signals) = mpsc::channel(2);

  let stdin_signal = signal_tx.clone();
  tokio::spawn(async move {
    let written = async {
      stdin.write_all(&input).await?;
      stdin.shutdown().await
    }.await;
    match written {
      Ok(()) => {}
      // The worker exited or closed stdin without reading its input.
      Err(e) if e.kind() == ErrorKind::BrokenPipe => debug!("Worker closed stdin early: {}", e),
      Err(e) => {
        let _ = stdin_signal.send(Completion::LaunchFailed(format!("failed to write worker payload: {}", e))).await;
      }
    }
  });

  tokio::spawn(async move {
    let completion = match child.wait().await {
      Ok(status) => Completion::Exited(status.code().unwrap_or(-1)),
      Err(e) => Completion::LaunchFailed(format!("failed to wait for worker: {}", e)),
    };
    let _ = signal_tx.send(completion).await;
  });

  Ok(WorkerProcess::new(Box::new(stdout), Box::new(stderr), signals))
}
