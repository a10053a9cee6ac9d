// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::interrupt::interrupt_requested;
use crate::tool::{Tool, ToolCall, ToolError, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;
/// Grace between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(100);

pub struct ShellTool {
    pub timeout_secs: u64,
    /// Upper bound a call may raise `timeout_secs` to.
    pub timeout_cap_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            timeout_cap_secs: 300,
        }
    }
}

enum ShellEnd {
    Exited(std::process::ExitStatus),
    TimedOut,
    Interrupted,
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell_execute"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its stdout and stderr.\n\
         Set workdir to run in a specific directory. Default timeout is 30 \
         seconds; raise timeout_secs for slow commands (capped by config). \
         Output is limited to 100,000 characters and truncated beyond that. \
         Non-zero exit codes are returned as errors with the exit code in \
         the output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "execute"
    }

    fn approval_summary(&self, call: &ToolCall) -> String {
        call.args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'command' argument"),
        };
        let workdir = call
            .args
            .get("workdir")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.timeout_secs)
            .min(self.timeout_cap_secs);

        debug!(cmd = %command, timeout, "shell_execute tool");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(wd) = &workdir {
            cmd.current_dir(wd);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("spawn error: {e}")),
        };

        // Drain the pipes concurrently so a chatty child never blocks on a
        // full pipe buffer while we wait on it.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let out_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(p) = stdout_pipe.as_mut() {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        });
        let err_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(p) = stderr_pipe.as_mut() {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
        let mut poll = tokio::time::interval(Duration::from_millis(50));
        let end = loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(s) => break ShellEnd::Exited(s),
                        Err(e) => {
                            return ToolOutput::err(&call.id, format!("wait error: {e}"));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    terminate_then_kill(&mut child).await;
                    break ShellEnd::TimedOut;
                }
                _ = poll.tick() => {
                    if interrupt_requested() {
                        terminate_then_kill(&mut child).await;
                        break ShellEnd::Interrupted;
                    }
                }
            }
        };

        let stdout = String::from_utf8_lossy(&out_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&err_task.await.unwrap_or_default()).into_owned();

        match end {
            ShellEnd::Interrupted => ToolError::Interrupted.into_output(&call.id),
            ShellEnd::TimedOut => ToolError::Timeout(timeout).into_output(&call.id),
            ShellEnd::Exited(status) => {
                let mut content = String::new();
                if !stdout.is_empty() {
                    content.push_str(&truncate(&stdout, OUTPUT_LIMIT));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&truncate(&stderr, OUTPUT_LIMIT));
                }
                if content.is_empty() {
                    content = format!("[exit {}]", status.code().unwrap_or(-1));
                }

                if status.success() {
                    ToolOutput::ok(&call.id, content)
                } else {
                    let code = status.code().unwrap_or(-1);
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
        }
    }
}

/// Send SIGTERM, wait the grace window, then SIGKILL and reap.
async fn terminate_then_kill(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    tokio::time::sleep(KILL_GRACE).await;
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            let _ = child.kill().await;
        }
    }
    let _ = child.wait().await;
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    // The cap is in bytes; a command's output is arbitrary UTF-8, so back
    // off to a char boundary before slicing.
    let mut cut = limit;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated {} bytes]", &s[..cut], s.len() - cut)
}
