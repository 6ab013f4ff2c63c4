use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
  Local,
  Docker,
}

impl FromStr for ExecutionMode {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self> {
    match s.trim().to_ascii_lowercase().as_str() {
      "local" => Ok(ExecutionMode::Local),
      "docker" | "container" => Ok(ExecutionMode::Docker),
      other => Err(anyhow!("Unknown execution mode: {}", other)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub worker_id: String,
  pub worker_concurrency: usize,
  pub execution_mode: ExecutionMode,
  pub python_bin: String,
  pub worker_dir: PathBuf,
  pub project_root: PathBuf,
  pub container_root: String,
  pub container_name: String,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let required = |key: &str| lookup(key).with_context(|| format!("{} must be set", key));
    let project_root = match lookup("PROJECT_ROOT") {
      Some(root) => std::path::absolute(&root).with_context(|| format!("Invalid PROJECT_ROOT '{}'", root))?,
      None => env::current_dir().context("Failed to resolve the current directory")?,
    };
    let worker_dir = lookup("WORKER_DIR")
      .map(PathBuf::from)
      .unwrap_or_else(|| project_root.join("server/business/ml"));

    Ok(Self {
      database_url: required("DATABASE_URL")?,
      rabbitmq_url: required("RABBITMQ_URL")?,
      server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
      worker_id: lookup("WORKER_ID").unwrap_or_else(|| "worker-1".into()),
      worker_concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", 4)?,
      execution_mode: parse_or(&lookup, "EXECUTION_MODE", ExecutionMode::Local)?,
      python_bin: lookup("PYTHON_BIN").unwrap_or_else(|| "python3".into()),
      worker_dir,
      project_root,
      container_root: lookup("CONTAINER_ROOT").unwrap_or_else(|| "/app".into()),
      container_name: lookup("CONTAINER_NAME").unwrap_or_else(|| "mlexec-worker".into()),
    })
  }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
  F: Fn(&str) -> Option<String>,
  T: FromStr,
  T::Err: std::fmt::Display,
{
  match lookup(key) {
    Some(raw) => raw.parse().map_err(|e| anyhow!("Invalid {} '{}': {}", key, raw, e)),
    None => Ok(default),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    move |key| vars.get(key).cloned()
  }

  #[test]
  fn defaults_apply_when_optional_vars_are_missing() {
    let config = Config::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/mlexec"),
      ("RABBITMQ_URL", "amqp://localhost"),
      ("PROJECT_ROOT", "/srv/xenix"),
    ])).unwrap();
    assert_eq!(config.server_port, 8080);
    assert_eq!(config.worker_concurrency, 4);
    assert_eq!(config.execution_mode, ExecutionMode::Local);
    assert_eq!(config.worker_dir, PathBuf::from("/srv/xenix/server/business/ml"));
    assert_eq!(config.container_root, "/app");
  }

  #[test]
  fn invalid_values_are_errors() {
    let err = Config::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/mlexec"),
      ("RABBITMQ_URL", "amqp://localhost"),
      ("EXECUTION_MODE", "kubernetes"),
    ])).unwrap_err();
    assert!(err.to_string().contains("EXECUTION_MODE"));

    assert!(Config::from_lookup(lookup(&[("RABBITMQ_URL", "amqp://localhost")])).is_err());
  }

  #[test]
  fn relative_project_root_is_made_absolute() {
    let config = Config::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/mlexec"),
      ("RABBITMQ_URL", "amqp://localhost"),
      ("PROJECT_ROOT", "deploy"),
    ])).unwrap();
    assert!(config.project_root.is_absolute());
    assert_eq!(config.project_root, env::current_dir().unwrap().join("deploy"));
    assert!(config.worker_dir.is_absolute());

    let err = Config::from_lookup(lookup(&[
      ("DATABASE_URL", "postgres://localhost/mlexec"),
      ("RABBITMQ_URL", "amqp://localhost"),
      ("PROJECT_ROOT", ""),
    ])).unwrap_err();
    assert!(err.to_string().contains("PROJECT_ROOT"));
  }

  #[test]
  fn docker_mode_is_recognized() {
    assert_eq!("Docker".parse::<ExecutionMode>().unwrap(), ExecutionMode::Docker);
  }
}
