// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
    /// When set, the session drops its conversation history after the
    /// result is persisted (used by sleep/reset style tools).
    pub clear_history: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            clear_history: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
            clear_history: false,
        }
    }

    /// Mark this result as requesting a conversation reset.
    pub fn with_clear_history(mut self) -> Self {
        self.clear_history = true;
        self
    }
}

/// Dispatch-layer failure classes.  Every variant maps to a user-visible
/// error [`ToolOutput`]; none abort the turn.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("denied by user")]
    Denied,
    #[error("denied automatically: repeated denials, backoff active")]
    BackoffActive,
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0}s")]
    Timeout(u64),
    #[error("protected path: {0}")]
    ProtectedPath(String),
    #[error("interrupted")]
    Interrupted,
}

impl ToolError {
    /// Convert into the error result sent back to the model.
    pub fn into_output(self, call_id: &str) -> ToolOutput {
        ToolOutput::err(call_id, self.to_string())
    }
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Approval category consulted by the gate and `--allow-category`
    /// (e.g. "read-only", "execute", "write", "agent").
    fn category(&self) -> &str;
    /// Short human-readable summary of a call's arguments, matched against
    /// `tool:pattern` allowlist entries and shown in approval prompts.
    /// The default is the compact JSON of the arguments.
    fn approval_summary(&self, call: &ToolCall) -> String {
        call.args.to_string()
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
