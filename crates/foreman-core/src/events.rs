// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use foreman_tools::ToolCall;

/// Events emitted by the session during a single turn.
/// Consumers (REPL, JSON output, supervisor) subscribe to these to drive
/// their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// A sub-agent child process was spawned
    SubAgentSpawned { id: String },
    /// Current token usage update
    TokenUsage { input: u32, output: u32 },
    /// The session has finished processing the current user turn
    TurnComplete,
    /// A recoverable error occurred
    Error(String),
}
