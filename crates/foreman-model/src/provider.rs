// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Context window size in tokens.
    fn context_window(&self) -> u32;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}

/// Return `true` when a provider error indicates the context window is full.
///
/// Providers report this in different shapes; the markers below cover the
/// OpenAI family ("context_length_exceeded", "maximum context length") and
/// llama.cpp-compatible servers ("exceed_context_size_error").  The session
/// maps such an error to its ContextExhausted result code instead of a
/// plain failure.
pub fn is_context_exhausted(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("context_length_exceeded")
        || msg.contains("exceed_context_size_error")
        || msg.contains("maximum context length")
        || msg.contains("context window")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_marker_detected() {
        let e = anyhow::anyhow!("openai error 400: {{\"code\":\"context_length_exceeded\"}}");
        assert!(is_context_exhausted(&e));
    }

    #[test]
    fn llama_cpp_marker_detected() {
        let e = anyhow::anyhow!("error 400: {{\"type\":\"exceed_context_size_error\",\"n_ctx\":8192}}");
        assert!(is_context_exhausted(&e));
    }

    #[test]
    fn unrelated_error_is_not_exhaustion() {
        let e = anyhow::anyhow!("connection refused");
        assert!(!is_context_exhausted(&e));
    }
}
