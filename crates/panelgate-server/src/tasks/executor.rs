//! Operation executors invoked by task workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use panelgate_core::config::{ExecutorCommand, TaskConfig};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::types::TaskType;
use crate::error::{Error, Result};

/// Why an executor did not produce a result. Recorded on the task row and
/// never returned to the submitter.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("Execution exceeded {0:?}")]
    TimedOut(Duration),

    #[error("Executor panicked")]
    Panicked,

    #[error("Failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("Invalid executor output: {0}")]
    InvalidOutput(String),
}

/// Performs one kind of operation given its JSON payload.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, payload: Value) -> std::result::Result<Value, ExecutionError>;
}

/// Executors keyed by the task type they handle.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry of [`ScriptExecutor`]s from configuration.
    pub fn from_config(config: &TaskConfig) -> Result<Self> {
        let mut registry = Self::new();
        for (name, command) in &config.executors {
            let task_type: TaskType = name.parse().map_err(|_| {
                Error::Validation(format!("executor configured for unknown task type: {name}"))
            })?;
            registry.register(task_type, Arc::new(ScriptExecutor::from(command)));
        }
        Ok(registry)
    }

    pub fn register(&mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(task_type, executor);
    }

    pub fn with(mut self, task_type: TaskType, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(task_type, executor);
        self
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// Runs an external command: the payload is written to its stdin as JSON and
/// its stdout is parsed as the JSON result. A non-zero exit fails the task
/// with the command's stderr.
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl ScriptExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl From<&ExecutorCommand> for ScriptExecutor {
    fn from(cmd: &ExecutorCommand) -> Self {
        Self::new(cmd.program.clone(), cmd.args.clone())
    }
}

#[async_trait]
impl TaskExecutor for ScriptExecutor {
    async fn execute(&self, payload: Value) -> std::result::Result<Value, ExecutionError> {
        let program = self.program.display().to_string();
        let launch_err = |e: std::io::Error| ExecutionError::Launch {
            program: program.clone(),
            message: e.to_string(),
        };

        // Killed if the worker gives up on it (timeout).
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = payload.to_string();
            // A script that exits without reading its input closes the pipe;
            // its exit status decides the outcome, not the write.
            if let Err(e) = stdin.write_all(input.as_bytes()).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(launch_err(e));
            }
            // Dropping stdin closes the pipe so the script sees EOF.
        }

        let output = child.wait_with_output().await.map_err(launch_err)?;
        debug!(program = %program, status = %output.status, "Executor finished");

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("{program} exited with {}", output.status)
            } else {
                stderr
            };
            return Err(ExecutionError::Failed(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&stdout).map_err(|e| ExecutionError::InvalidOutput(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sh(script: &str) -> ScriptExecutor {
        ScriptExecutor::new("/bin/sh", vec!["-c".into(), script.into()])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_receives_payload_and_returns_json() {
        let result = sh("cat").execute(json!({ "user": "alice" })).await.unwrap();
        assert_eq!(result, json!({ "user": "alice" }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let err = sh("echo 'no such user' >&2; exit 3")
            .execute(json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Failed(ref m) if m == "no such user"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_json_output_is_invalid() {
        let err = sh("echo done").execute(json!({})).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidOutput(_)));
    }

    #[tokio::test]
    async fn missing_program_fails_to_launch() {
        let err = ScriptExecutor::new("/nonexistent/panelgate-executor", vec![])
            .execute(json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Launch { .. }));
    }

    #[test]
    fn registry_from_config_rejects_unknown_type() {
        let mut executors = BTreeMap::new();
        executors.insert(
            "format-disk".to_string(),
            ExecutorCommand {
                program: "/bin/true".into(),
                args: vec![],
            },
        );
        let config = TaskConfig {
            executors,
            ..TaskConfig::default()
        };
        assert!(ExecutorRegistry::from_config(&config).is_err());
    }

    #[test]
    fn registry_from_config_registers_scripts() {
        let mut executors = BTreeMap::new();
        executors.insert(
            "generate-ssh-key".to_string(),
            ExecutorCommand {
                program: "/usr/local/libexec/panel/keygen".into(),
                args: vec![],
            },
        );
        let config = TaskConfig {
            executors,
            ..TaskConfig::default()
        };
        let registry = ExecutorRegistry::from_config(&config).unwrap();
        assert!(registry.contains(TaskType::GenerateSshKey));
        assert!(!registry.contains(TaskType::InviteUser));
        assert_eq!(registry.len(), 1);
    }
}
