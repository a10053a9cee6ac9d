// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user
/// explicitly disables them need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub subagents: SubAgentConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" (any OpenAI-compatible endpoint),
    /// "mock", or "scripted-mock" (tests only).
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Base URL override.  Useful for local servers, LiteLLM, or proxies.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Name of the request field carrying the output-token limit.
    /// Newer OpenAI models use "max_completion_tokens"; most compatible
    /// servers still expect "max_tokens".
    #[serde(default = "default_max_tokens_field")]
    pub max_tokens_field: String,
    /// Context window size in tokens (used for exhaustion detection)
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Stream responses (SSE).  Disabled by `--no-stream`.
    #[serde(default = "default_true")]
    pub stream: bool,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

fn default_max_tokens_field() -> String {
    "max_tokens".into()
}
fn default_context_window() -> u32 {
    128_000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            name: "gpt-4o".into(),
            api_key_env: None,
            base_url: None,
            max_tokens: Some(4096),
            max_tokens_field: default_max_tokens_field(),
            context_window: default_context_window(),
            stream: true,
            temperature: Some(0.2),
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    20
}
fn default_tool_result_char_cap() -> usize {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model↔tool rounds per turn.  On exceeding the cap the
    /// session appends an explanatory system message and ends the turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Hard character cap applied to each tool result before it is
    /// appended to the conversation.
    #[serde(default = "default_tool_result_char_cap")]
    pub tool_result_char_cap: usize,
    /// Optional system prompt override (verbatim)
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            tool_result_char_cap: default_tool_result_char_cap(),
            system_prompt: None,
        }
    }
}

fn default_shell_timeout() -> u64 {
    30
}
fn default_shell_timeout_cap() -> u64 {
    300
}
fn default_backoff_window_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Allowlist entries of the form `tool:pattern` — the named tool is
    /// auto-approved when its command/summary matches the glob pattern.
    /// A bare `tool` entry approves every call to that tool.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Approval categories auto-approved wholesale (e.g. "read-only").
    #[serde(default)]
    pub allow_categories: Vec<String>,
    /// Skip the approval gate entirely.
    #[serde(default)]
    pub yolo: bool,
    /// Default shell execution timeout in seconds.
    #[serde(default = "default_shell_timeout")]
    pub shell_timeout_secs: u64,
    /// Upper bound a tool call may raise the shell timeout to.
    #[serde(default = "default_shell_timeout_cap")]
    pub shell_timeout_cap_secs: u64,
    /// Paths the file tools must never mutate, protected by both
    /// canonical path and inode identity.
    #[serde(default)]
    pub protected_paths: Vec<String>,
    /// Sliding window for the denial backoff rate limiter.
    #[serde(default = "default_backoff_window_secs")]
    pub backoff_window_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            allow_categories: Vec::new(),
            yolo: false,
            shell_timeout_secs: default_shell_timeout(),
            shell_timeout_cap_secs: default_shell_timeout_cap(),
            protected_paths: Vec::new(),
            backoff_window_secs: default_backoff_window_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    8
}
fn default_wait_timeout() -> u64 {
    300
}

/// The per-parent concurrency limit may be raised in config but never
/// beyond this.
pub const SUBAGENT_HARD_CAP: usize = 20;
/// Upper bound on `wait_timeout_secs` (one hour).
pub const SUBAGENT_WAIT_CAP_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentConfig {
    /// Maximum concurrently running sub-agents per parent process.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Default timeout for `subagent_wait`, in seconds.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for SubAgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

impl SubAgentConfig {
    /// Effective concurrency limit after clamping to the hard cap.
    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent.min(SUBAGENT_HARD_CAP)
    }

    /// Effective wait timeout after clamping to the hard cap.
    pub fn effective_wait_timeout_secs(&self) -> u64 {
        self.wait_timeout_secs.min(SUBAGENT_WAIT_CAP_SECS)
    }
}

fn default_tick_secs() -> u64 {
    10
}
fn default_worker_idle_timeout() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Periodic wake interval for the supervisor event loop, in seconds.
    /// A stall guard: stalled goal states eventually re-prompt the model.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Seconds a worker waits for claimable work before exiting.
    #[serde(default = "default_worker_idle_timeout")]
    pub worker_idle_timeout_secs: u64,
    /// Default maximum delivery attempts per work item.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Suppress synthetic re-prompts on pure timer wakes
    /// (completion notifications still drive turns).
    #[serde(default)]
    pub no_auto_messages: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            worker_idle_timeout_secs: default_worker_idle_timeout(),
            max_attempts: default_max_attempts(),
            no_auto_messages: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_tool_rounds_is_twenty() {
        assert_eq!(AgentConfig::default().max_tool_rounds, 20);
    }

    #[test]
    fn default_shell_timeout_is_thirty_seconds() {
        let t = ToolsConfig::default();
        assert_eq!(t.shell_timeout_secs, 30);
        assert_eq!(t.shell_timeout_cap_secs, 300);
    }

    #[test]
    fn subagent_limits_clamp_to_hard_caps() {
        let c = SubAgentConfig {
            max_concurrent: 500,
            wait_timeout_secs: 86_400,
        };
        assert_eq!(c.effective_max_concurrent(), SUBAGENT_HARD_CAP);
        assert_eq!(c.effective_wait_timeout_secs(), SUBAGENT_WAIT_CAP_SECS);
    }

    #[test]
    fn subagent_limits_below_cap_pass_through() {
        let c = SubAgentConfig::default();
        assert_eq!(c.effective_max_concurrent(), 8);
        assert_eq!(c.effective_wait_timeout_secs(), 300);
    }

    #[test]
    fn config_deserializes_from_partial_yaml() {
        let cfg: Config = serde_yaml::from_str("agent:\n  max_tool_rounds: 5\n").unwrap();
        assert_eq!(cfg.agent.max_tool_rounds, 5);
        // Untouched sections fall back to defaults
        assert_eq!(cfg.model.provider, "openai");
        assert!(!cfg.tools.yolo);
    }

    #[test]
    fn supervisor_defaults_match_contract() {
        let s = SupervisorConfig::default();
        assert_eq!(s.tick_secs, 10);
        assert_eq!(s.worker_idle_timeout_secs, 60);
        assert_eq!(s.max_attempts, 3);
        assert!(!s.no_auto_messages);
    }

    #[test]
    fn model_stream_defaults_on() {
        let m: ModelConfig = serde_yaml::from_str("provider: openai\nname: m").unwrap();
        assert!(m.stream);
        assert_eq!(m.max_tokens_field, "max_tokens");
    }
}
