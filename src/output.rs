// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Terminal and JSON renderers for the session's event stream.
//!
//! Text mode streams deltas to stdout and puts tool traffic on stderr so
//! piped output stays clean.  JSON mode emits exactly one JSON object per
//! event on stdout and nothing else.

use std::io::Write;

use serde_json::json;
use tokio::sync::mpsc;

use foreman_core::{AgentEvent, TurnOutcome};

pub struct EventPrinter {
    handle: tokio::task::JoinHandle<()>,
}

impl EventPrinter {
    pub fn spawn(mut rx: mpsc::Receiver<AgentEvent>, json_mode: bool, stream: bool) -> Self {
        let handle = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if json_mode {
                    print_json(&ev);
                } else {
                    print_text(&ev, stream);
                }
            }
        });
        Self { handle }
    }

    /// Wait for the sender side to drop and the tail to flush.
    pub async fn finish(self) {
        let _ = self.handle.await;
        let _ = std::io::stdout().flush();
    }
}

fn print_json(ev: &AgentEvent) {
    let obj = match ev {
        AgentEvent::TextDelta(_) => return, // full text arrives in TextComplete
        AgentEvent::TextComplete(text) => json!({ "kind": "text", "text": text }),
        AgentEvent::ToolCallStarted(tc) => json!({
            "kind": "tool_call",
            "id": tc.id,
            "tool": tc.name,
            "args": tc.args,
        }),
        AgentEvent::ToolCallFinished {
            call_id,
            tool_name,
            output,
            is_error,
        } => json!({
            "kind": "tool_result",
            "id": call_id,
            "tool": tool_name,
            "output": output,
            "is_error": is_error,
        }),
        AgentEvent::SubAgentSpawned { id } => json!({ "kind": "subagent", "id": id }),
        AgentEvent::TokenUsage { input, output } => json!({
            "kind": "usage",
            "input_tokens": input,
            "output_tokens": output,
        }),
        AgentEvent::Error(detail) => json!({ "kind": "error", "detail": detail }),
        AgentEvent::TurnComplete => return,
    };
    println!("{obj}");
}

fn print_text(ev: &AgentEvent, stream: bool) {
    match ev {
        AgentEvent::TextDelta(delta) if stream => {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::TextDelta(_) => {}
        AgentEvent::TextComplete(text) => {
            if stream {
                println!();
            } else {
                println!("{text}");
            }
        }
        AgentEvent::ToolCallStarted(tc) => {
            eprintln!("[foreman] → {} {}", tc.name, tc.args);
        }
        AgentEvent::ToolCallFinished {
            tool_name,
            output,
            is_error,
            ..
        } => {
            let tag = if *is_error { "failed" } else { "ok" };
            let first = output.lines().next().unwrap_or("");
            eprintln!("[foreman] ← {tool_name} {tag}: {first}");
        }
        AgentEvent::SubAgentSpawned { id } => {
            eprintln!("[foreman] sub-agent {id} spawned");
        }
        AgentEvent::TokenUsage { .. } => {}
        AgentEvent::Error(detail) => {
            eprintln!("[foreman] error: {detail}");
        }
        AgentEvent::TurnComplete => {}
    }
}

/// Final result line.  In JSON mode every error surfaces as
/// `{"kind":"error","detail":...}` and the run ends with a result object.
pub fn print_result(json_mode: bool, outcome: TurnOutcome) {
    if json_mode {
        println!("{}", json!({ "kind": "result", "code": outcome.code() }));
    }
}
