// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sub-agent child processes and their approval-proxy channel.
//!
//! A sub-agent is this same binary re-executed in background mode with a
//! focused task.  The parent keeps two pipes per child: one carrying
//! approval requests child→parent, one carrying decisions parent→child,
//! with the child ends' fd numbers handed down in the environment.  The
//! parent polls the request side on every event-loop turn and answers
//! through its own approval gate.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use foreman_config::SubAgentConfig;
use foreman_tools::{Tool, ToolCall, ToolOutput};

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalReplyMsg, ApprovalRequestMsg};
use crate::notify::{set_cloexec, set_nonblocking, AsyncEvent};
use crate::services::Services;

pub const ENV_IS_SUBAGENT: &str = "IS_SUBAGENT";
pub const ENV_APPROVAL_REQUEST_FD: &str = "APPROVAL_REQUEST_FD";
pub const ENV_APPROVAL_REPLY_FD: &str = "APPROVAL_REPLY_FD";

/// Grace between SIGTERM and SIGKILL when timing a sub-agent out.
const KILL_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubAgentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl SubAgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

struct SubAgentEntry {
    id: String,
    pid: u32,
    child: Child,
    status: SubAgentStatus,
    /// Accumulated stdout, filled by a reader task.
    output: Arc<StdMutex<String>>,
    /// Parent end of the request pipe (non-blocking reads).
    req_read: File,
    /// Parent end of the reply pipe.
    reply_write: File,
    /// Partial request line carried across poll turns.
    line_buf: String,
    task: String,
    spawned_at: Instant,
}

impl SubAgentEntry {
    /// Update status from child liveness; no-op once terminal.
    fn refresh(&mut self) {
        if self.status != SubAgentStatus::Running {
            return;
        }
        if let Ok(Some(exit)) = self.child.try_wait() {
            self.status = if exit.success() {
                SubAgentStatus::Completed
            } else {
                SubAgentStatus::Failed
            };
            debug!(id = %self.id, status = self.status.as_str(), "sub-agent exited");
        }
    }
}

/// Parent-side registry and lifecycle manager for sub-agent processes.
pub struct SubAgentManager {
    agents: Mutex<HashMap<String, SubAgentEntry>>,
    max_concurrent: usize,
    wait_timeout: Duration,
    gate: Arc<ApprovalGate>,
    services: Arc<Services>,
}

impl SubAgentManager {
    pub fn new(cfg: &SubAgentConfig, gate: Arc<ApprovalGate>, services: Arc<Services>) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            max_concurrent: cfg.effective_max_concurrent(),
            wait_timeout: Duration::from_secs(cfg.effective_wait_timeout_secs()),
            gate,
            services,
        }
    }

    /// Spawn a sub-agent for `task`.  Refused when this process is itself
    /// a sub-agent or when the concurrency cap is reached.
    pub async fn spawn(&self, task: &str, context: Option<&str>) -> anyhow::Result<String> {
        if std::env::var_os(ENV_IS_SUBAGENT).is_some() {
            anyhow::bail!("sub-agents may not spawn further sub-agents");
        }

        let mut agents = self.agents.lock().await;
        for entry in agents.values_mut() {
            entry.refresh();
        }
        let running = agents
            .values()
            .filter(|a| a.status == SubAgentStatus::Running)
            .count();
        if running >= self.max_concurrent {
            anyhow::bail!(
                "sub-agent limit reached ({running}/{} running)",
                self.max_concurrent
            );
        }

        // Request pipe: child writes, parent reads.
        let (req_read, req_write) = make_pipe()?;
        // Reply pipe: parent writes, child reads.
        let (reply_read, reply_write) = make_pipe()?;
        // Parent ends must not leak into the child and the request side is
        // polled, never blocked on.
        set_cloexec(req_read.as_raw_fd())?;
        set_cloexec(reply_write.as_raw_fd())?;
        set_nonblocking(req_read.as_raw_fd())?;

        let id = hex::encode(&uuid::Uuid::new_v4().as_bytes()[..4]);
        let exe = std::env::current_exe().context("resolving current executable")?;

        let mut cmd = Command::new(exe);
        cmd.arg("--mode")
            .arg("background")
            .arg("--task")
            .arg(task)
            .env(ENV_IS_SUBAGENT, "1")
            .env("FOREMAN_SUBAGENT_ID", &id)
            .env(ENV_APPROVAL_REQUEST_FD, req_write.as_raw_fd().to_string())
            .env(ENV_APPROVAL_REPLY_FD, reply_read.as_raw_fd().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if let Some(ctx) = context {
            cmd.arg("--context").arg(ctx);
        }

        let mut child = cmd.spawn().context("spawning sub-agent process")?;
        let pid = child.id().unwrap_or(0);
        // The child inherited its ends across exec; drop ours.
        drop(req_write);
        drop(reply_read);

        let output = Arc::new(StdMutex::new(String::new()));
        if let Some(mut stdout) = child.stdout.take() {
            let acc = output.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                            acc.lock().unwrap().push_str(&chunk);
                        }
                    }
                }
            });
        }

        debug!(id = %id, pid, task, "spawned sub-agent");
        agents.insert(
            id.clone(),
            SubAgentEntry {
                id: id.clone(),
                pid,
                child,
                status: SubAgentStatus::Running,
                output,
                req_read: File::from(req_read),
                reply_write: File::from(reply_write),
                line_buf: String::new(),
                task: task.to_string(),
                spawned_at: Instant::now(),
            },
        );
        drop(agents);

        // Re-poke any event loop blocked in select.
        self.services.notify_event(AsyncEvent::SubAgentSpawned);
        Ok(id)
    }

    /// Current status and accumulated output of a sub-agent.
    pub async fn status(&self, id: &str) -> Option<(SubAgentStatus, String)> {
        let mut agents = self.agents.lock().await;
        let entry = agents.get_mut(id)?;
        entry.refresh();
        let out = entry.output.lock().unwrap().clone();
        Some((entry.status, out))
    }

    /// Number of sub-agents currently running.
    pub async fn running_count(&self) -> usize {
        let mut agents = self.agents.lock().await;
        agents
            .values_mut()
            .map(|e| {
                e.refresh();
                e
            })
            .filter(|e| e.status == SubAgentStatus::Running)
            .count()
    }

    /// Block until the sub-agent finishes or `timeout` expires; a timeout
    /// terminates the child (SIGTERM, grace, SIGKILL) and reports
    /// `TimedOut`.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Option<(SubAgentStatus, String)> {
        let cap = Duration::from_secs(foreman_config::SUBAGENT_WAIT_CAP_SECS);
        let timeout = timeout.unwrap_or(self.wait_timeout).min(cap);
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut agents = self.agents.lock().await;
                let entry = agents.get_mut(id)?;
                entry.refresh();
                if entry.status != SubAgentStatus::Running {
                    let out = entry.output.lock().unwrap().clone();
                    return Some((entry.status, out));
                }
                if Instant::now() >= deadline {
                    terminate_then_kill(&mut entry.child).await;
                    entry.status = SubAgentStatus::TimedOut;
                    let out = entry.output.lock().unwrap().clone();
                    warn!(id = %entry.id, task = %entry.task, "sub-agent timed out");
                    return Some((entry.status, out));
                }
                // Honour cancellation promptly while waiting.
                if foreman_tools::interrupt::interrupt_requested() {
                    let out = entry.output.lock().unwrap().clone();
                    return Some((entry.status, out));
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Poll every running sub-agent's approval channel; handle at most one
    /// pending request per agent per call.  Called from the owning event
    /// loop on each turn.
    pub async fn poll_approvals(&self) {
        let mut agents = self.agents.lock().await;
        for entry in agents.values_mut() {
            if entry.status != SubAgentStatus::Running {
                continue;
            }
            let Some(line) = read_available_line(&mut entry.req_read, &mut entry.line_buf) else {
                continue;
            };
            let request: ApprovalRequestMsg = match serde_json::from_str(line.trim()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "malformed approval request");
                    continue;
                }
            };
            self.services.notify_event(AsyncEvent::ApprovalNeeded);

            let decision = match self
                .gate
                .decide(&request.tool, &request.summary, "subagent")
                .await
            {
                Ok(d) => d,
                Err(_) => ApprovalDecision::Deny,
            };
            debug!(
                id = %entry.id,
                tool = %request.tool,
                decision = decision.as_str(),
                "answered sub-agent approval request"
            );
            let reply = serde_json::to_string(&ApprovalReplyMsg {
                decision: decision.as_str().to_string(),
            })
            .expect("reply serialization cannot fail");
            if writeln!(entry.reply_write, "{reply}")
                .and_then(|_| entry.reply_write.flush())
                .is_err()
            {
                warn!(id = %entry.id, "approval reply channel closed");
            }
        }
    }

    /// Elapsed time and pid for display/status tooling.
    pub async fn describe(&self, id: &str) -> Option<(u32, Duration, String)> {
        let agents = self.agents.lock().await;
        let entry = agents.get(id)?;
        Some((entry.pid, entry.spawned_at.elapsed(), entry.task.clone()))
    }

    /// Terminate every running sub-agent (process shutdown path).
    pub async fn shutdown_all(&self) {
        let mut agents = self.agents.lock().await;
        for entry in agents.values_mut() {
            entry.refresh();
            if entry.status == SubAgentStatus::Running {
                terminate_then_kill(&mut entry.child).await;
                entry.status = SubAgentStatus::Failed;
            }
        }
    }
}

fn make_pipe() -> anyhow::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("creating pipe");
    }
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Drain whatever is readable without blocking; return the first complete
/// line, leaving any partial tail in `buf`.
fn read_available_line(file: &mut File, buf: &mut String) -> Option<String> {
    let mut chunk = [0u8; 1024];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.push_str(&String::from_utf8_lossy(&chunk[..n])),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
    let pos = buf.find('\n')?;
    let line = buf[..pos].to_string();
    *buf = buf[pos + 1..].to_string();
    Some(line)
}

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

// ─── Tool surface ────────────────────────────────────────────────────────────

use async_trait::async_trait;
use serde_json::{json, Value};

pub struct SubAgentSpawnTool {
    pub mgr: Arc<SubAgentManager>,
}

#[async_trait]
impl Tool for SubAgentSpawnTool {
    fn name(&self) -> &str {
        "subagent_spawn"
    }

    fn description(&self) -> &str {
        "Spawn a background sub-agent process to work on a focused task. \
         Returns the sub-agent id immediately; poll with subagent_status \
         or block with subagent_wait. Sub-agents cannot spawn further \
         sub-agents."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "Task for the sub-agent" },
                "context": { "type": "string", "description": "Extra context (optional)" }
            },
            "required": ["task"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "agent"
    }

    fn approval_summary(&self, call: &ToolCall) -> String {
        call.args
            .get("task")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let task = match call.args.get("task").and_then(|v| v.as_str()) {
            Some(t) => t,
            None => return ToolOutput::err(&call.id, "missing 'task' argument"),
        };
        let context = call.args.get("context").and_then(|v| v.as_str());
        match self.mgr.spawn(task, context).await {
            Ok(id) => ToolOutput::ok(&call.id, format!("spawned sub-agent {id}")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

pub struct SubAgentStatusTool {
    pub mgr: Arc<SubAgentManager>,
}

#[async_trait]
impl Tool for SubAgentStatusTool {
    fn name(&self) -> &str {
        "subagent_status"
    }

    fn description(&self) -> &str {
        "Report the status (running/completed/failed/timed_out) and \
         accumulated output of a sub-agent spawned with subagent_spawn."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Sub-agent id" }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "agent"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("id").and_then(|v| v.as_str()) {
            Some(i) => i,
            None => return ToolOutput::err(&call.id, "missing 'id' argument"),
        };
        match self.mgr.status(id).await {
            Some((status, output)) => ToolOutput::ok(
                &call.id,
                format!("status: {}\n{output}", status.as_str()),
            ),
            None => ToolOutput::err(&call.id, format!("unknown sub-agent: {id}")),
        }
    }
}

pub struct SubAgentWaitTool {
    pub mgr: Arc<SubAgentManager>,
}

#[async_trait]
impl Tool for SubAgentWaitTool {
    fn name(&self) -> &str {
        "subagent_wait"
    }

    fn description(&self) -> &str {
        "Block until a sub-agent finishes and return its final status and \
         output. A timed-out sub-agent is terminated and reported as \
         timed_out."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "Sub-agent id" },
                "timeout_secs": { "type": "integer", "description": "Wait timeout (optional)" }
            },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "agent"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("id").and_then(|v| v.as_str()) {
            Some(i) => i,
            None => return ToolOutput::err(&call.id, "missing 'id' argument"),
        };
        let timeout = call
            .args
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);
        match self.mgr.wait(id, timeout).await {
            Some((status, output)) => {
                let text = format!("status: {}\n{output}", status.as_str());
                if status == SubAgentStatus::Completed {
                    ToolOutput::ok(&call.id, text)
                } else {
                    ToolOutput::err(&call.id, text)
                }
            }
            None => ToolOutput::err(&call.id, format!("unknown sub-agent: {id}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::AutoDenyPrompt;
    use foreman_config::ToolsConfig;

    fn manager(max: usize) -> SubAgentManager {
        let cfg = SubAgentConfig {
            max_concurrent: max,
            wait_timeout_secs: 5,
        };
        let gate = Arc::new(ApprovalGate::new(&ToolsConfig::default(), Arc::new(AutoDenyPrompt)));
        SubAgentManager::new(&cfg, gate, Arc::new(Services::new(None)))
    }

    #[tokio::test]
    async fn status_of_unknown_agent_is_none() {
        let m = manager(4);
        assert!(m.status("deadbeef").await.is_none());
    }

    #[tokio::test]
    async fn running_count_starts_at_zero() {
        let m = manager(4);
        assert_eq!(m.running_count().await, 0);
    }

    #[tokio::test]
    async fn nested_spawn_is_refused() {
        let m = manager(4);
        std::env::set_var(ENV_IS_SUBAGENT, "1");
        let err = m.spawn("anything", None).await.unwrap_err();
        std::env::remove_var(ENV_IS_SUBAGENT);
        assert!(err.to_string().contains("may not spawn"));
    }

    #[test]
    fn read_available_line_handles_partial_lines() {
        // A socketpair-free test: use a real pipe.
        let (read, write) = make_pipe().unwrap();
        set_nonblocking(read.as_raw_fd()).unwrap();
        let mut reader = File::from(read);
        let mut writer = File::from(write);

        let mut buf = String::new();
        write!(writer, "{{\"partial\":").unwrap();
        assert!(read_available_line(&mut reader, &mut buf).is_none());
        writeln!(writer, "true}}").unwrap();
        let line = read_available_line(&mut reader, &mut buf).unwrap();
        assert_eq!(line, "{\"partial\":true}");
        assert!(buf.is_empty());
    }

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(SubAgentStatus::Running.as_str(), "running");
        assert_eq!(SubAgentStatus::TimedOut.as_str(), "timed_out");
    }
}
