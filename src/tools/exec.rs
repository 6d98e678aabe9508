//! Shell execution tool: `exec` (aliased as `shell`).
//!
//! Commands run through `sh -c` in their own process group with a
//! non-interactive environment, so cancellation and timeout can signal
//! the whole descendant tree: SIGINT first, then SIGKILL after a 100 ms
//! grace period.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{path_guard, truncate_output, Tool, ToolContext, ToolResult, MAX_SHELL_OUTPUT};

/// Default command timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Grace period between SIGINT and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Environment forced onto every child so nothing blocks on a prompt.
pub(crate) const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GIT_ASKPASS", ""),
    ("SSH_ASKPASS", ""),
    ("CI", "true"),
];

/// Executes shell commands within the workspace.
pub struct Exec {
    name: &'static str,
}

impl Default for Exec {
    fn default() -> Self {
        Self { name: "exec" }
    }
}

impl Exec {
    /// The same tool registered under the `shell` name, since models are
    /// trained on both spellings.
    #[must_use]
    pub fn shell_alias() -> Self {
        Self { name: "shell" }
    }
}

#[derive(Deserialize)]
struct ExecArgs {
    #[serde(alias = "command")]
    cmd: String,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    timeout_sec: u64,
}

enum WaitOutcome {
    Done(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Tool for Exec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        "Execute a shell command. Commands run within the workspace root by default. Returns stdout, stderr, and exit code."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "Command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (relative to workspace root)",
                    "default": ""
                },
                "env": {
                    "type": "object",
                    "description": "Additional environment variables"
                },
                "timeout_sec": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 120)",
                    "default": 120
                }
            },
            "required": ["cmd"]
        })
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> ToolResult {
        let start = Instant::now();
        let mut a: ExecArgs = match serde_json::from_value(args) {
            Ok(a) => a,
            Err(e) => return ToolResult::failed(self.name(), e, 0.0),
        };
        if a.timeout_sec == 0 {
            a.timeout_sec = DEFAULT_TIMEOUT_SECS;
        }

        let work_dir = if a.cwd.is_empty() {
            ctx.workspace_root.clone()
        } else {
            match path_guard::resolve(&ctx.workspace_root, &a.cwd) {
                Ok(p) => p,
                Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
            }
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&a.cmd)
            .current_dir(&work_dir)
            .envs(&a.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        for (key, value) in NON_INTERACTIVE_ENV {
            cmd.env(key, value);
        }

        // New process group so group signals reach descendants.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(cmd = %a.cmd, "spawning shell command");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64()),
        };
        let child_pid = child.id();

        let stdout_task = drain_pipe(child.stdout.take());
        let stderr_task = drain_pipe(child.stderr.take());

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => WaitOutcome::Cancelled,
            waited = tokio::time::timeout(Duration::from_secs(a.timeout_sec), child.wait()) => {
                match waited {
                    Ok(status) => WaitOutcome::Done(status),
                    Err(_) => WaitOutcome::TimedOut,
                }
            }
        };

        match outcome {
            WaitOutcome::Done(Ok(status)) => {
                let stdout = join_pipe(stdout_task).await;
                let stderr = join_pipe(stderr_task).await;
                let mut output = stdout;
                if !stderr.is_empty() {
                    if !output.is_empty() {
                        output.push_str("\n--- stderr ---\n");
                    }
                    output.push_str(&stderr);
                }
                ToolResult {
                    name: self.name().to_string(),
                    output: truncate_output(output, MAX_SHELL_OUTPUT),
                    error: None,
                    duration_seconds: start.elapsed().as_secs_f64(),
                    exit_code: status.code().unwrap_or(-1),
                }
            }
            WaitOutcome::Done(Err(e)) => {
                ToolResult::failed(self.name(), e, start.elapsed().as_secs_f64())
            }
            WaitOutcome::TimedOut => {
                signal_group_and_reap(&mut child, child_pid).await;
                ToolResult {
                    name: self.name().to_string(),
                    output: format!("Command timed out after {} seconds", a.timeout_sec),
                    error: Some("timeout".to_string()),
                    duration_seconds: start.elapsed().as_secs_f64(),
                    exit_code: -1,
                }
            }
            WaitOutcome::Cancelled => {
                signal_group_and_reap(&mut child, child_pid).await;
                ToolResult {
                    name: self.name().to_string(),
                    output: "Command cancelled".to_string(),
                    error: Some("operation cancelled".to_string()),
                    duration_seconds: start.elapsed().as_secs_f64(),
                    exit_code: -1,
                }
            }
        }
    }
}

/// Read one of the child's pipes to the end on its own task.
fn drain_pipe<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

async fn join_pipe(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Signal the child's process group: SIGINT, a short grace, then SIGKILL,
/// and reap the child so it does not linger as a zombie.
async fn signal_group_and_reap(child: &mut tokio::process::Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        let pgid = pid as libc::pid_t;
        unsafe {
            libc::kill(-pgid, libc::SIGINT);
        }
        tokio::time::sleep(KILL_GRACE).await;
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}
