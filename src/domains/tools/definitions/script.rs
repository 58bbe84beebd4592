//! Script tools run as a subprocess per call.
//!
//! Protocol: the arguments object is written to the child's stdin as JSON,
//! the child prints its JSON result on stdout and exits 0. A non-zero exit
//! is an execution failure carrying the child's stderr.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::domains::tools::capability::{JsonObject, Tool, ToolCore, ToolKind};
use crate::domains::tools::descriptor::ToolDescriptor;
use crate::domains::tools::error::ExecutionError;
use crate::domains::tools::schema::ToolSchema;

const STDERR_LIMIT: usize = 2048;

/// A tool backed by an external script.
pub struct ScriptTool {
    core: ToolCore,
    path: PathBuf,
    /// Program used to run the script (e.g. `sh`, `python3`); the script is
    /// executed directly when absent.
    interpreter: Option<String>,
}

impl ScriptTool {
    pub fn new(
        descriptor: Arc<ToolDescriptor>,
        schema: ToolSchema,
        path: PathBuf,
        interpreter: Option<String>,
    ) -> Self {
        Self {
            core: ToolCore::new(descriptor, schema),
            path,
            interpreter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self) -> Command {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(&self.path);
                c
            }
            None => Command::new(&self.path),
        };
        if let Some(dir) = self.path.parent() {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out call drops the future; the child goes with it.
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Tool for ScriptTool {
    fn describe(&self) -> Arc<ToolDescriptor> {
        self.core.descriptor.clone()
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Script
    }

    fn schema(&self) -> &ToolSchema {
        &self.core.schema
    }

    #[instrument(skip_all, fields(tool = %self.core.name()))]
    async fn execute(&self, args: JsonObject) -> Result<Value, ExecutionError> {
        let input = serde_json::to_vec(&Value::Object(args))
            .map_err(|e| ExecutionError::failed(format!("failed to encode arguments: {}", e)))?;

        let mut child = self.command().spawn().map_err(|e| {
            ExecutionError::failed(format!("failed to start {}: {}", self.path.display(), e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // Scripts that ignore their input may exit before reading it.
            if let Err(e) = stdin.write_all(&input).await {
                debug!("Script did not consume stdin: {}", e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutionError::failed(format!("failed to wait for script: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = truncate(stderr.trim(), STDERR_LIMIT);
            warn!("Script exited with {}", output.status);
            return Err(
                ExecutionError::failed(format!("script exited with {}", output.status))
                    .with_data(json!({
                        "exit_code": output.status.code(),
                        "stderr": stderr,
                    })),
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout)
            .map_err(|e| ExecutionError::parse(format!("script output is not JSON: {}", e)))
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domains::tools::error::ExecutionErrorKind;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn script_tool(dir: &Path, body: &str) -> ScriptTool {
        let path = dir.join("tool.sh");
        fs::write(&path, body).unwrap();
        let descriptor: ToolDescriptor = serde_json::from_value(json!({
            "name": "script_tool",
            "implementation_locator": "script:tool.sh",
            "version": "0.1.0"
        }))
        .unwrap();
        ScriptTool::new(
            Arc::new(descriptor),
            ToolSchema::compile(json!({ "type": "object" }), json!({})).unwrap(),
            path,
            Some("sh".to_string()),
        )
    }

    fn args(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_script_reads_stdin_and_returns_json() {
        let dir = TempDir::new().unwrap();
        let tool = script_tool(dir.path(), "read input\necho \"{\\\"got\\\": $input}\"\n");

        let out = tool.execute(args(json!({ "x": 1 }))).await.unwrap();
        assert_eq!(out["got"]["x"], 1);
    }

    #[tokio::test]
    async fn test_script_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let tool = script_tool(dir.path(), "echo 'upstream down' >&2\nexit 3\n");

        let err = tool.execute(args(json!({}))).await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Failed);
        let data = err.data.unwrap();
        assert_eq!(data["exit_code"], 3);
        assert_eq!(data["stderr"], "upstream down");
    }

    #[tokio::test]
    async fn test_script_non_json_output() {
        let dir = TempDir::new().unwrap();
        let tool = script_tool(dir.path(), "echo not-json\n");

        let err = tool.execute(args(json!({}))).await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::Parse);
    }

    #[test]
    fn test_truncate_respects_limit() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
