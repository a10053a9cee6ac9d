// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion driver.
//!
//! Most hosted and local providers speak the same `/chat/completions` SSE
//! streaming wire format; this single driver covers all of them.  Configure
//! via `foreman_config::ModelConfig` and construct through
//! `foreman_model::from_config`.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent, Role};

/// OpenAI-compatible chat completion provider.
pub struct OpenAICompatProvider {
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).  `None` → no auth header
    /// (local servers such as llama.cpp or vLLM).
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_tokens: u32,
    /// Request field carrying the output-token limit ("max_tokens" or
    /// "max_completion_tokens").
    max_tokens_field: String,
    temperature: f32,
    context_window: u32,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    /// `base_url` ends **before** `/chat/completions`, e.g.
    /// `https://api.openai.com/v1`.
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        max_tokens_field: String,
        temperature: Option<f32>,
        context_window: u32,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            max_tokens_field,
            temperature: temperature.unwrap_or(0.2),
            context_window,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_openai_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "temperature": self.temperature,
        });
        // The field name differs across providers ("max_tokens" vs
        // "max_completion_tokens"), so it cannot be a literal key above.
        body[self.max_tokens_field.as_str()] = json!(self.max_tokens);
        if req.stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .context("chat completion request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("provider error {status}: {text}");
        }

        if !req.stream {
            // Non-streaming: one JSON body, synthesised into the same event
            // sequence the SSE path produces.
            let v: Value = resp.json().await.context("reading completion body")?;
            return Ok(Box::pin(futures::stream::iter(parse_nonstream_body(&v))));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(parse_sse_chunk(&v))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_sse_chunk(v: &Value) -> anyhow::Result<ResponseEvent> {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    let delta = &v["choices"][0]["delta"];

    // Tool call delta — each SSE chunk carries one tool-call delta; the
    // index routes accumulation for parallel calls.
    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            return Ok(ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments: args,
            });
        }
    }

    // Text delta
    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return Ok(ResponseEvent::TextDelta(text.to_string()));
    }

    Ok(ResponseEvent::TextDelta(String::new()))
}

/// Synthesize the streaming event sequence from a non-streaming response
/// body so the session loop has a single consumption path.
fn parse_nonstream_body(v: &Value) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    let message = &v["choices"][0]["message"];
    if let Some(text) = message.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(Ok(ResponseEvent::TextDelta(text.to_string())));
        }
    }
    if let Some(tool_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for (i, tc) in tool_calls.iter().enumerate() {
            events.push(Ok(ResponseEvent::ToolCall {
                index: i as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            }));
        }
    }
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        events.push(Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        }));
    }
    events.push(Ok(ResponseEvent::Done));
    events
}

/// Convert a slice of [`Message`]s into the OpenAI wire-format JSON array.
///
/// **Parallel tool call coalescing**: the wire format requires all tool
/// calls from one assistant turn inside a *single* assistant message as a
/// `tool_calls` array.  Foreman stores each call as a separate
/// `MessageContent::ToolCall` entry internally, so consecutive entries are
/// merged here before sending.
pub(crate) fn build_openai_messages(messages: &[crate::Message]) -> Vec<Value> {
    use crate::MessageContent;

    fn tool_call_to_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if let MessageContent::ToolCall {
            tool_call_id,
            function,
        } = &m.content
        {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall {
                    tool_call_id,
                    function,
                } = &messages[i].content
                {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::ContentParts(parts) => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        crate::ContentPart::Text { text } => {
                            json!({ "type": "text", "text": text })
                        }
                        crate::ContentPart::Image { image_url } => json!({
                            "type": "image_url",
                            "image_url": { "url": image_url },
                        }),
                    })
                    .collect();
                json!({ "role": role_str(&m.role), "content": content })
            }
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
            MessageContent::ToolResult {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        };
        result.push(v);
        i += 1;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    // ── SSE parsing ───────────────────────────────────────────────────────────

    #[test]
    fn parse_sse_text_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"hello"}}]}"#;
        let ev = parse_sse_data_line(line).unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn parse_sse_done_sentinel() {
        let ev = parse_sse_data_line("data: [DONE]").unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::Done));
    }

    #[test]
    fn parse_sse_tool_call_start_with_id_and_name() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"shell_execute","arguments":""}}]}}]}"#;
        let ev = parse_sse_data_line(line).unwrap().unwrap();
        match ev {
            ResponseEvent::ToolCall { index, id, name, .. } => {
                assert_eq!(index, 0);
                assert_eq!(id, "c1");
                assert_eq!(name, "shell_execute");
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn parse_sse_tool_call_args_delta() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"com"}}]}}]}"#;
        let ev = parse_sse_data_line(line).unwrap().unwrap();
        match ev {
            ResponseEvent::ToolCall { arguments, id, name, .. } => {
                assert_eq!(arguments, "{\"com");
                assert!(id.is_empty());
                assert!(name.is_empty());
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn parse_sse_usage_event() {
        let line = r#"data: {"usage":{"prompt_tokens":12,"completion_tokens":7},"choices":[]}"#;
        let ev = parse_sse_data_line(line).unwrap().unwrap();
        assert!(matches!(
            ev,
            ResponseEvent::Usage { input_tokens: 12, output_tokens: 7 }
        ));
    }

    #[test]
    fn sse_event_split_across_two_chunks_is_parsed_correctly() {
        let mut buf = String::new();
        buf.push_str(r#"data: {"choices":[{"delta":{"con"#);
        let events = drain_complete_sse_lines(&mut buf);
        assert!(events.is_empty(), "incomplete line must be retained");

        buf.push_str("tent\":\"split\"}}]}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        let ev = events.into_iter().next().unwrap().unwrap();
        assert!(matches!(ev, ResponseEvent::TextDelta(t) if t == "split"));
    }

    #[test]
    fn windows_crlf_line_endings_are_handled() {
        let mut buf = String::from("data: [DONE]\r\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events.into_iter().next().unwrap().unwrap(),
            ResponseEvent::Done
        ));
    }

    // ── Wire-format serialization ─────────────────────────────────────────────

    #[test]
    fn plain_text_message_serialized_as_string_content() {
        let msgs = build_openai_messages(&[Message::user("hi")]);
        assert_eq!(msgs[0]["role"], "user");
        assert_eq!(msgs[0]["content"], "hi");
    }

    #[test]
    fn two_consecutive_tool_call_messages_coalesced_into_one_assistant_message() {
        let msgs = build_openai_messages(&[
            Message::tool_call("c1", "a", "{}"),
            Message::tool_call("c2", "b", "{}"),
            Message::tool_result("c1", "r1"),
            Message::tool_result("c2", "r2"),
        ]);
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0]["tool_calls"].as_array().unwrap().len(), 2);
        assert_eq!(msgs[1]["role"], "tool");
        assert_eq!(msgs[2]["tool_call_id"], "c2");
    }

    #[test]
    fn tool_result_serialized_with_matching_call_id() {
        let msgs = build_openai_messages(&[Message::tool_result("call-9", "output")]);
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "call-9");
        assert_eq!(msgs[0]["content"], "output");
    }

    // ── Non-streaming body ────────────────────────────────────────────────────

    #[test]
    fn nonstream_body_with_text_yields_delta_then_done() {
        let v: Value = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2}
        });
        let events: Vec<_> = parse_nonstream_body(&v)
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert!(matches!(&events[0], ResponseEvent::TextDelta(t) if t == "hello"));
        assert!(matches!(events.last(), Some(ResponseEvent::Done)));
    }

    #[test]
    fn nonstream_body_with_tool_calls_yields_full_calls() {
        let v: Value = serde_json::json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "function": {"name": "shell_execute", "arguments": "{\"command\":\"ls\"}"}}
            ]}}]
        });
        let events: Vec<_> = parse_nonstream_body(&v)
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert!(matches!(
            &events[0],
            ResponseEvent::ToolCall { id, name, .. } if id == "c1" && name == "shell_execute"
        ));
    }
}
