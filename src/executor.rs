//! Task lifecycle: pending → running → completed | failed.
//!
//! [`TaskExecutor::run`] marks the task running, launches its worker, feeds
//! every output line to the [`ProtocolDispatcher`] and commits exactly one
//! terminal status. The exit code decides the outcome; worker status reports
//! never do.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{Completion, ExecutionBackend, LaunchRequest, WorkerProcess};
use crate::error::ExecError;
use crate::models::{Task, TaskOutcome};
use crate::protocol::ProtocolDispatcher;
use crate::store::{LogSink, TaskStore};
use crate::stream::{StderrTail, StreamMultiplexer};

/// Lets exactly one terminal trigger through per task.
#[derive(Debug, Default)]
pub struct TerminalGuard {
  claimed: AtomicBool,
}

impl TerminalGuard {
  pub fn new() -> Self {
    Self::default()
  }

  /// `true` for the first caller only.
  pub fn claim(&self) -> bool {
    self.claimed
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  #[cfg(test)]
  fn is_claimed(&self) -> bool {
    self.claimed.load(Ordering::Acquire)
  }
}

pub struct TaskExecutor {
  backend: Arc<dyn ExecutionBackend>,
  tasks: Arc<dyn TaskStore>,
  logs: Arc<dyn LogSink>,
  worker_dir: PathBuf,
  working_dir: PathBuf,
}

impl TaskExecutor {
  pub fn new(
    backend: Arc<dyn ExecutionBackend>,
    tasks: Arc<dyn TaskStore>,
    logs: Arc<dyn LogSink>,
    worker_dir: impl Into<PathBuf>,
    working_dir: impl Into<PathBuf>,
  ) -> Self {
    Self {
      backend,
      tasks,
      logs,
      worker_dir: worker_dir.into(),
      working_dir: working_dir.into(),
    }
  }

  /// Runs a task to its terminal status and returns the committed outcome.
  ///
  /// Only failures to mark the task running or to commit the terminal status
  /// are returned; everything else ends up in the task's `error` field or the
  /// operational log.
  pub async fn run(&self, task: &Task) -> Result<TaskOutcome, ExecError> {
    let task_id = task.id;
    if !self.tasks.mark_running(task_id).await? {
      return Err(ExecError::NotRunnable(task_id));
    }
    info!(task_id = %task_id, task_type = %task.task_type, backend = self.backend.name(), "Task running");

    let guard = TerminalGuard::new();
    let request = LaunchRequest {
      worker_path: self.worker_dir.join(task.task_type.worker_script()),
      payload: task.parameter.clone(),
      working_dir: self.working_dir.clone(),
    };

    let process = match self.backend.launch(request).await {
      Ok(process) => process,
      Err(e) => {
        error!(task_id = %task_id, "Worker launch failed: {}", e);
        let outcome = TaskOutcome::Failed(e.to_string());
        self.commit(&guard, task_id, &outcome).await?;
        return Ok(outcome);
      }
    };

    self.supervise(task_id, &guard, process).await
  }

  async fn supervise(&self, task_id: Uuid, guard: &TerminalGuard, process: WorkerProcess) -> Result<TaskOutcome, ExecError> {
    let WorkerProcess { stdout, stderr, mut signals } = process;
    let mut mux = StreamMultiplexer::spawn(stdout, stderr);
    let tail = mux.stderr_tail();
    let mut dispatcher = ProtocolDispatcher::new(task_id, self.tasks.clone(), self.logs.clone());

    // Results must be stored before the terminal status, so the first trigger
    // is only acted upon once both streams are drained.
    let drain = async {
      while let Some(line) = mux.next_line().await {
        dispatcher.dispatch(&line).await;
      }
    };
    let ((), first) = tokio::join!(drain, signals.recv());
    mux.join().await;

    let outcome = match first {
      Some(completion) => outcome_for(completion, &tail),
      None => TaskOutcome::Failed("worker ended without reporting an exit status".into()),
    };
    self.commit(guard, task_id, &outcome).await?;

    while let Some(late) = signals.recv().await {
      self.commit(guard, task_id, &outcome_for(late, &tail)).await?;
    }

    let stats = dispatcher.stats();
    info!(
      task_id = %task_id,
      status = %outcome.status(),
      logs = stats.logs,
      results = stats.results,
      status_hints = stats.status_hints,
      unstructured = stats.unstructured,
      persistence_failures = stats.persistence_failures,
      "Task finished"
    );
    Ok(outcome)
  }

  /// Writes the terminal status if `guard` has not been claimed yet.
  async fn commit(&self, guard: &TerminalGuard, task_id: Uuid, outcome: &TaskOutcome) -> Result<bool, ExecError> {
    if !guard.claim() {
      debug!(task_id = %task_id, ?outcome, "Terminal status already committed, ignoring trigger");
      return Ok(false);
    }
    match self.tasks.finalize(task_id, outcome).await {
      Ok(true) => {
        info!(task_id = %task_id, status = %outcome.status(), "Terminal status committed");
        Ok(true)
      }
      Ok(false) => {
        warn!(task_id = %task_id, "Task already had a terminal status");
        Ok(false)
      }
      Err(e) => {
        error!(task_id = %task_id, "Failed to commit terminal status: {:#}", e);
        Err(ExecError::Persistence(e))
      }
    }
  }
}

fn outcome_for(completion: Completion, tail: &StderrTail) -> TaskOutcome {
  match completion {
    Completion::Exited(0) => TaskOutcome::Completed,
    Completion::Exited(code) => TaskOutcome::Failed(
      tail.last().unwrap_or_else(|| format!("worker exited with code {}", code)),
    ),
    Completion::LaunchFailed(message) => TaskOutcome::Failed(message),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::OutputStream;
  use crate::models::{TaskStatus, TaskType};
  use crate::store::MemoryStore;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::Mutex;
  use tokio::sync::mpsc;
  use tokio_test::io::Builder;

  /// Replays canned output and completion signals.
  struct ScriptedBackend {
    stdout: Mutex<Option<Vec<&'static [u8]>>>,
    signals: Vec<Completion>,
  }

  impl ScriptedBackend {
    fn new(stdout: Vec<&'static [u8]>, signals: Vec<Completion>) -> Self {
      Self { stdout: Mutex::new(Some(stdout)), signals }
    }
  }

  #[async_trait]
  impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
      "scripted"
    }

    async fn launch(&self, _request: LaunchRequest) -> Result<WorkerProcess, ExecError> {
      let chunks = self.stdout.lock().unwrap().take().unwrap_or_default();
      let mut builder = Builder::new();
      for chunk in chunks {
        builder.read(chunk);
      }
      let stdout: OutputStream = Box::new(builder.build());
      let stderr: OutputStream = Box::new(Builder::new().build());
      let (tx, rx) = mpsc::channel(2);
      for signal in &self.signals {
        tx.send(signal.clone()).await.unwrap();
      }
      Ok(WorkerProcess::new(stdout, stderr, rx))
    }
  }

  struct RefusingBackend;

  #[async_trait]
  impl ExecutionBackend for RefusingBackend {
    fn name(&self) -> &'static str {
      "refusing"
    }

    async fn launch(&self, _request: LaunchRequest) -> Result<WorkerProcess, ExecError> {
      Err(ExecError::Launch("failed to start 'python3': No such file or directory".into()))
    }
  }

  async fn run_with(backend: Arc<dyn ExecutionBackend>) -> (Arc<MemoryStore>, Task, Result<TaskOutcome, ExecError>) {
    let store = Arc::new(MemoryStore::new());
    let task = Task::new(TaskType::Tuning, json!({"model": "Ridge"}), 5);
    store.insert_task(&task).await.unwrap();
    let executor = TaskExecutor::new(backend, store.clone(), store.clone(), "/opt/ml", "/opt");
    let outcome = executor.run(&task).await;
    let stored = store.get_task(task.id).await.unwrap().unwrap();
    (store, stored, outcome)
  }

  #[test]
  fn guard_admits_one_claim_across_threads() {
    let guard = Arc::new(TerminalGuard::new());
    let claims: Vec<bool> = (0..8)
      .map(|_| {
        let guard = guard.clone();
        std::thread::spawn(move || guard.claim())
      })
      .collect::<Vec<_>>()
      .into_iter()
      .map(|h| h.join().unwrap())
      .collect();
    assert_eq!(claims.iter().filter(|c| **c).count(), 1);
    assert!(guard.is_claimed());
  }

  #[tokio::test]
  async fn launch_error_and_exit_commit_once() {
    let backend = ScriptedBackend::new(
      vec![b"{\"type\":\"result\",\"data\":{\"model\":\"Ridge\"}}\n"],
      vec![Completion::LaunchFailed("failed to write worker payload: reset".into()), Completion::Exited(0)],
    );
    let (_, stored, outcome) = run_with(Arc::new(backend)).await;

    let outcome = outcome.unwrap();
    assert_eq!(outcome, TaskOutcome::Failed("failed to write worker payload: reset".into()));
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("failed to write worker payload: reset"));
    assert_eq!(stored.result, Some(json!({"model": "Ridge"})));
  }

  #[tokio::test]
  async fn exit_code_overrides_reported_failure() {
    let backend = ScriptedBackend::new(
      vec![b"{\"type\":\"status\",\"data\":{\"status\":\"failed\",\"error\":\"soft error\"}}\n"],
      vec![Completion::Exited(0)],
    );
    let (_, stored, outcome) = run_with(Arc::new(backend)).await;

    assert_eq!(outcome.unwrap(), TaskOutcome::Completed);
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.error, None);
  }

  #[tokio::test]
  async fn silent_nonzero_exit_reports_code() {
    let backend = ScriptedBackend::new(vec![], vec![Completion::Exited(3)]);
    let (_, stored, _) = run_with(Arc::new(backend)).await;

    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("worker exited with code 3"));
  }

  #[tokio::test]
  async fn refused_launch_fails_task() {
    let (store, stored, outcome) = run_with(Arc::new(RefusingBackend)).await;

    assert!(matches!(outcome.unwrap(), TaskOutcome::Failed(_)));
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error.unwrap().contains("No such file or directory"));
    assert!(stored.started_at.is_some());
    assert_eq!(store.log_count().await, 0);
  }

  #[tokio::test]
  async fn finished_task_is_not_rerun() {
    let store = Arc::new(MemoryStore::new());
    let task = Task::new(TaskType::Tuning, json!({}), 5);
    store.insert_task(&task).await.unwrap();
    store.finalize(task.id, &TaskOutcome::Completed).await.unwrap();

    let executor = TaskExecutor::new(Arc::new(RefusingBackend), store.clone(), store.clone(), "/opt/ml", "/opt");
    let err = executor.run(&task).await.unwrap_err();
    assert!(matches!(err, ExecError::NotRunnable(id) if id == task.id));
  }
}
