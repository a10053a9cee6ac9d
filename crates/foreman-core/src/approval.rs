// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The approval gate: policy layer between parsed tool calls and execution.
//!
//! Consulted sources, in order: yolo mode, per-session remembered
//! approvals, the static allowlist, the denial backoff, and finally the
//! interactive prompt.  Denials feed the backoff; an explicit approval
//! resets it.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use foreman_config::ToolsConfig;
use foreman_tools::{AllowList, DenialBackoff, ToolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Allow,
    Deny,
    /// Allow, and remember the tool for the rest of the session.
    AllowSession,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::AllowSession => "allow_session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "allow_session" => Some(Self::AllowSession),
            _ => None,
        }
    }
}

/// Wire format of a sub-agent approval request (one JSON line).
#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalRequestMsg {
    pub tool: String,
    pub summary: String,
    pub sub_agent_id: String,
}

/// Wire format of the parent's reply (one JSON line).
#[derive(Debug, Serialize, Deserialize)]
pub struct ApprovalReplyMsg {
    pub decision: String,
}

/// Last-resort decision source when neither allowlist nor backoff settle a
/// call.  Interactive wrappers prompt the user; headless runs auto-deny;
/// sub-agents proxy to their parent.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn request(&self, tool: &str, summary: &str) -> anyhow::Result<ApprovalDecision>;
}

/// Headless default: no terminal to ask, so deny.
pub struct AutoDenyPrompt;

#[async_trait]
impl ApprovalPrompt for AutoDenyPrompt {
    async fn request(&self, _tool: &str, _summary: &str) -> anyhow::Result<ApprovalDecision> {
        Ok(ApprovalDecision::Deny)
    }
}

/// The gate itself.  One per session; shared with the sub-agent manager so
/// proxied requests run through the same policy.
pub struct ApprovalGate {
    yolo: bool,
    allowlist: AllowList,
    backoff: DenialBackoff,
    session_allows: Mutex<HashSet<String>>,
    prompt: Arc<dyn ApprovalPrompt>,
}

impl ApprovalGate {
    pub fn new(cfg: &ToolsConfig, prompt: Arc<dyn ApprovalPrompt>) -> Self {
        Self {
            yolo: cfg.yolo,
            allowlist: AllowList::from_config(cfg),
            backoff: DenialBackoff::new(Duration::from_secs(cfg.backoff_window_secs)),
            session_allows: Mutex::new(HashSet::new()),
            prompt,
        }
    }

    /// Full decision, including the allow-session distinction needed when
    /// replying to a proxied sub-agent request.
    pub async fn decide(
        &self,
        tool: &str,
        summary: &str,
        category: &str,
    ) -> Result<ApprovalDecision, ToolError> {
        if self.yolo {
            return Ok(ApprovalDecision::Allow);
        }
        if self.session_allows.lock().unwrap().contains(tool) {
            return Ok(ApprovalDecision::Allow);
        }
        if self.allowlist.allows(tool, summary, category) {
            return Ok(ApprovalDecision::Allow);
        }
        if self.backoff.is_blocked(tool) {
            debug!(tool, "auto-denied: backoff active");
            return Err(ToolError::BackoffActive);
        }

        match self.prompt.request(tool, summary).await {
            Ok(ApprovalDecision::Allow) => {
                self.backoff.reset(tool);
                Ok(ApprovalDecision::Allow)
            }
            Ok(ApprovalDecision::AllowSession) => {
                self.session_allows.lock().unwrap().insert(tool.to_string());
                self.backoff.reset(tool);
                Ok(ApprovalDecision::AllowSession)
            }
            Ok(ApprovalDecision::Deny) => {
                self.backoff.record_denial(tool);
                Err(ToolError::Denied)
            }
            // Transport failure is not a user decision: deny with a
            // distinct error and do NOT feed the backoff.
            Err(e) => {
                warn!(tool, error = %e, "approval channel failed");
                Err(ToolError::ExecutionFailed(format!(
                    "approval channel closed: {e}"
                )))
            }
        }
    }

    /// Gate check used by the dispatch pipeline.
    pub async fn check(&self, tool: &str, summary: &str, category: &str) -> Result<(), ToolError> {
        self.decide(tool, summary, category).await.map(|_| ())
    }
}

/// Child-side prompt for sub-agent processes.
///
/// Writes one JSON request line to `APPROVAL_REQUEST_FD` and blocks
/// reading one JSON reply line from `APPROVAL_REPLY_FD`.  One request at a
/// time per sub-agent.
pub struct ProxyApprovalPrompt {
    sub_agent_id: String,
    channel: Arc<Mutex<(File, BufReader<File>)>>,
}

impl ProxyApprovalPrompt {
    /// # Safety contract
    /// `request_fd` / `reply_fd` must be the pipe ends handed down by the
    /// parent in the environment; ownership transfers here.
    pub fn from_fds(sub_agent_id: String, request_fd: RawFd, reply_fd: RawFd) -> Self {
        let writer = unsafe { File::from_raw_fd(request_fd) };
        let reader = BufReader::new(unsafe { File::from_raw_fd(reply_fd) });
        Self {
            sub_agent_id,
            channel: Arc::new(Mutex::new((writer, reader))),
        }
    }
}

#[async_trait]
impl ApprovalPrompt for ProxyApprovalPrompt {
    async fn request(&self, tool: &str, summary: &str) -> anyhow::Result<ApprovalDecision> {
        let msg = serde_json::to_string(&ApprovalRequestMsg {
            tool: tool.to_string(),
            summary: summary.to_string(),
            sub_agent_id: self.sub_agent_id.clone(),
        })?;

        // Blocking pipe I/O happens off the async executor.
        let channel = self.channel.clone();
        let reply_line = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            let mut guard = channel.lock().unwrap();
            let (writer, reader) = &mut *guard;
            writeln!(writer, "{msg}")?;
            writer.flush()?;
            let mut line = String::new();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                anyhow::bail!("approval channel closed by parent");
            }
            Ok(line)
        })
        .await??;

        let reply: ApprovalReplyMsg = serde_json::from_str(reply_line.trim())?;
        ApprovalDecision::parse(&reply.decision)
            .ok_or_else(|| anyhow::anyhow!("unknown approval decision: {}", reply.decision))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
