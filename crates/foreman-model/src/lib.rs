// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod mock;
mod openai_compat;
mod provider;
mod types;

pub use mock::{MockProvider, ScriptedMockProvider};
pub use openai_compat::OpenAICompatProvider;
pub use provider::{is_context_exhausted, ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, ContentPart, FunctionCall, Message, MessageContent, ResponseEvent, Role,
    ToolSchema, Usage,
};

use foreman_config::ModelConfig;

/// Construct a provider from configuration.
///
/// `"mock"` yields the deterministic echo provider (tests, dry runs);
/// anything else is treated as an OpenAI-compatible endpoint.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Box<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Box::new(MockProvider)),
        _ => {
            let api_key = cfg
                .api_key_env
                .as_deref()
                .or(Some("OPENAI_API_KEY"))
                .and_then(|var| std::env::var(var).ok())
                .filter(|k| !k.is_empty());
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".into());
            Ok(Box::new(OpenAICompatProvider::new(
                cfg.name.clone(),
                api_key,
                &base_url,
                cfg.max_tokens,
                cfg.max_tokens_field.clone(),
                cfg.temperature,
                cfg.context_window,
            )))
        }
    }
}
