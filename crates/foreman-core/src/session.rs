// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The session: conversation state plus the synchronous turn procedure
//! (model call → tool dispatch → re-enter) that everything else wraps.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use foreman_config::AgentConfig;
use foreman_model::{
    is_context_exhausted, CompletionRequest, Message, ModelProvider, ResponseEvent, Role,
};
use foreman_tools::interrupt::interrupt_requested;
use foreman_tools::{ToolCall, ToolError};

use crate::dispatch::Dispatcher;
use crate::events::AgentEvent;
use crate::services::Services;
use crate::transcript::Transcript;

/// Result of one turn.  The numeric codes are part of the embedding
/// contract (supervisor exit codes, JSON output).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Ok,
    Failure,
    Cancelled,
    ContextExhausted,
}

impl TurnOutcome {
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Failure => -1,
            Self::Cancelled => -2,
            Self::ContextExhausted => -3,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Per-call options for [`Session::process`].
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Append the user text to history before running.  Callers that have
    /// already staged the message themselves (supervisor notification
    /// folding) set this to false.
    pub append_user: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self { append_user: true }
    }
}

pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    model: Arc<dyn ModelProvider>,
    dispatcher: Dispatcher,
    config: Arc<AgentConfig>,
    services: Arc<Services>,
    system_prompt: Option<String>,
    transcript: Option<Transcript>,
    /// Images queued for the next user message (data URLs).
    pending_images: Vec<String>,
    /// Error detail of the last failed turn, for the executor's contract.
    pub last_error: Option<String>,
    stream: bool,
}

impl Session {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        dispatcher: Dispatcher,
        config: Arc<AgentConfig>,
        services: Arc<Services>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            model,
            dispatcher,
            config,
            services,
            system_prompt: None,
            transcript: None,
            pending_images: Vec::new(),
            last_error: None,
            stream: true,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Queue an image to attach to the next user message.
    pub fn queue_image(&mut self, data_url: impl Into<String>) {
        self.pending_images.push(data_url.into());
    }

    /// Append a message to history (and the transcript, when configured).
    pub fn push(&mut self, msg: Message) {
        if let Some(t) = &self.transcript {
            t.append(&msg);
        }
        self.messages.push(msg);
    }

    /// Process one user message synchronously: the bounded model↔tool
    /// loop.  Streams output through `tx`; observes `cancel` and the
    /// process-wide interrupt flag at safe points.
    pub async fn process(
        &mut self,
        user_text: &str,
        opts: ProcessOptions,
        tx: mpsc::Sender<AgentEvent>,
        cancel: &AtomicBool,
    ) -> TurnOutcome {
        let cancelled = |cancel: &AtomicBool| cancel.load(Ordering::SeqCst) || interrupt_requested();
        self.last_error = None;

        if self.messages.is_empty() {
            if let Some(sp) = self.system_prompt.clone() {
                self.push(Message::system(sp));
            }
        }
        if opts.append_user {
            let msg = if self.pending_images.is_empty() {
                Message::user(user_text)
            } else {
                let images = std::mem::take(&mut self.pending_images);
                Message::user_with_images(user_text, images)
            };
            self.push(msg);
        }

        let mut rounds = 0u32;
        loop {
            if cancelled(cancel) {
                return TurnOutcome::Cancelled;
            }

            rounds += 1;
            if rounds > self.config.max_tool_rounds {
                // Runaway guard: explain the cap and end the turn cleanly.
                self.push(Message::system(format!(
                    "Tool-call round limit of {} reached for this turn; \
                     no further tools will run. Summarise your progress.",
                    self.config.max_tool_rounds
                )));
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return TurnOutcome::Ok;
            }

            let (text, tool_calls) = match self.stream_one_turn(&tx).await {
                Ok(t) => t,
                Err(e) => {
                    if is_context_exhausted(&e) {
                        return TurnOutcome::ContextExhausted;
                    }
                    // Protocol / transport failure: the assistant turn is
                    // not appended.
                    warn!(error = %e, "model turn failed");
                    self.last_error = Some(e.to_string());
                    let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                    return TurnOutcome::Failure;
                }
            };

            if !text.is_empty() {
                self.push(Message::assistant(&text));
                let _ = tx.send(AgentEvent::TextComplete(text)).await;
            }

            // Cancellation observed once the response is fully read.
            if cancelled(cancel) {
                return TurnOutcome::Cancelled;
            }

            if tool_calls.is_empty() {
                let _ = tx.send(AgentEvent::TurnComplete).await;
                return TurnOutcome::Ok;
            }

            // Phase 1: append the assistant batch, in model-emitted order.
            let batch_start = self.messages.len();
            for tc in &tool_calls {
                let _ = tx.send(AgentEvent::ToolCallStarted(tc.clone())).await;
                self.push(Message::tool_call(&tc.id, &tc.name, tc.args.to_string()));
            }

            // Phase 2: dispatch in the same order.  Once an interrupt is
            // observed, the remaining calls in the batch are answered with
            // interrupted results so every call still gets exactly one
            // matching result.
            let mut interrupted = false;
            let mut outputs = Vec::with_capacity(tool_calls.len());
            for tc in &tool_calls {
                let output = if interrupted {
                    ToolError::Interrupted.into_output(&tc.id)
                } else {
                    self.dispatcher.dispatch(tc).await
                };
                if cancelled(cancel) {
                    interrupted = true;
                }
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        call_id: tc.id.clone(),
                        tool_name: tc.name.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error,
                    })
                    .await;
                outputs.push(output);
            }

            // Phase 3: append results in batch order.
            let cap = self.config.tool_result_char_cap;
            let mut clear_requested = false;
            for (tc, output) in tool_calls.iter().zip(outputs.iter()) {
                self.push(Message::tool_result(&tc.id, truncate(&output.content, cap)));
                if output.clear_history {
                    clear_requested = true;
                }
            }

            if clear_requested {
                self.clear_history_keeping_batch(batch_start);
            }

            if interrupted {
                return TurnOutcome::Cancelled;
            }
        }
    }

    /// Convenience wrapper for callers without a cancellation flag.
    pub async fn process_simple(
        &mut self,
        user_text: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> TurnOutcome {
        let cancel = AtomicBool::new(false);
        self.process(user_text, ProcessOptions::default(), tx, &cancel)
            .await
    }

    /// Drop everything before the tool-call batch starting at
    /// `batch_start`, keeping a leading system message.  The batch and its
    /// results survive so the model can see what the reset tool reported.
    fn clear_history_keeping_batch(&mut self, batch_start: usize) {
        let mut kept: Vec<Message> = Vec::new();
        if let Some(first) = self.messages.first() {
            if first.role == Role::System {
                kept.push(first.clone());
            }
        }
        kept.extend(self.messages.drain(batch_start..));
        self.messages = kept;
        debug!(len = self.messages.len(), "conversation history cleared");
    }

    /// One model round: send the request, stream events, and collect the
    /// final text plus any tool calls (ordered by provider index).
    async fn stream_one_turn(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<(String, Vec<ToolCall>)> {
        let tools: Vec<foreman_model::ToolSchema> = self
            .dispatcher
            .registry()
            .schemas()
            .into_iter()
            .map(|s| foreman_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        let req = CompletionRequest {
            messages: self.messages.clone(),
            tools,
            stream: self.stream,
        };

        let mut stream = self.model.complete(req).await?;

        let mut full_text = String::new();
        // Keyed by the parallel-tool-call index from the provider; chunks
        // for different calls may interleave.
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    full_text.push_str(&delta);
                    let _ = tx.send(AgentEvent::TextDelta(delta)).await;
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let ptc = pending.entry(index).or_insert_with(PendingToolCall::default);
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: input_tokens,
                            output: output_tokens,
                        })
                        .await;
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    warn!("model stream error: {e}");
                }
            }
        }

        // Flush accumulated tool calls ordered by index.  An empty name
        // cannot be dispatched and is dropped; an empty id gets a
        // synthetic fallback so the batch still round-trips.
        let mut pending_sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        pending_sorted.sort_by_key(|(idx, _)| *idx);
        let mut tool_calls = Vec::new();
        for (i, (_, ptc)) in pending_sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name");
                continue;
            }
            let mut tc = ptc.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
                warn!(tool = %tc.name, "tool call had empty id; generated synthetic id");
            }
            tool_calls.push(tc);
        }

        Ok((full_text, tool_calls))
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    // The cap is in bytes; back off to a char boundary so a multi-byte
    // character straddling the limit never splits the slice.
    let mut cut = limit;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated {} bytes]", &s[..cut], s.len() - cut)
}

#[cfg(test)]
mod truncate_tests {
    use super::truncate;

    #[test]
    fn short_input_is_untouched() {
        assert_eq!(truncate("hello", 100), "hello");
    }

    #[test]
    fn ascii_input_cuts_at_the_limit() {
        let out = truncate("abcdef", 3);
        assert!(out.starts_with("abc"));
        assert!(out.contains("truncated 3 bytes"));
    }

    #[test]
    fn limit_inside_a_multibyte_char_backs_off_to_a_boundary() {
        // "日" is 3 bytes; a limit of 4 lands mid-character.
        let s = "ab日cd";
        let out = truncate(s, 4);
        assert!(out.starts_with("ab..."), "must cut before the split char: {out}");
    }

    #[test]
    fn limit_on_a_boundary_keeps_the_full_char() {
        let s = "ab日cd";
        let out = truncate(s, 5);
        assert!(out.starts_with("ab日..."));
    }

    #[test]
    fn long_non_ascii_tail_near_the_cap_does_not_panic() {
        let mut s = "a".repeat(99_999);
        s.push_str(&"日".repeat(10));
        let out = truncate(&s, 100_000);
        assert!(out.contains("truncated"));
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCall {
        // Empty arguments resolve to {} (no-arg tools); invalid JSON is
        // left as null so the dispatch validator reports bad arguments.
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        error = %e,
                        "tool call arguments are not valid JSON"
                    );
                    serde_json::Value::Null
                }
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            args,
        }
    }
}
