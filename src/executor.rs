//! Execution layer seam.
//!
//! The engine never interprets a task's config; it hands the request to a
//! [`TaskExecutor`] and records whatever comes back.

use crate::engine::ExecutionRequest;
use crate::types::{TaskFailure, TaskResult};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<TaskResult, TaskFailure>;
}

/// Runs the `sh` entry of a task's config with `sh -c`.
///
/// Params are exported as `TASK_PARAMS` (JSON). If stdout is a JSON object it
/// becomes the task's carry params. Tasks without an `sh` entry succeed
/// without doing anything.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<TaskResult, TaskFailure> {
        let Some(script) = request.config.get("sh").and_then(Value::as_str) else {
            return Ok(TaskResult::default());
        };

        debug!(task = %request.task_name, retry_count = request.retry_count, "running shell task");
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .env("TASK_PARAMS", request.params.to_string())
            .env("TASK_NAME", &request.task_name)
            .env("TASK_RETRY_COUNT", request.retry_count.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TaskFailure::new(format!("failed to spawn sh: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(TaskFailure {
                message: format!("command exited with status {}", exit_code),
                details: json!({ "exit_code": exit_code, "stderr": stderr }),
                retry_interval_secs: None,
            });
        }

        let carry_params = serde_json::from_str::<Value>(stdout.trim())
            .ok()
            .filter(Value::is_object)
            .unwrap_or(Value::Null);
        Ok(TaskResult {
            carry_params,
            output: json!({ "exit_code": exit_code, "stdout": stdout }),
            ..TaskResult::default()
        })
    }
}
