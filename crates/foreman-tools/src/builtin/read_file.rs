// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolOutput};

const READ_LIMIT: usize = 200_000;

#[derive(Default)]
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its contents. \
         Large files are truncated at 200,000 characters."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path to read" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "read-only"
    }

    fn approval_summary(&self, call: &ToolCall) -> String {
        call.args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'path' argument"),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(mut text) => {
                if text.len() > READ_LIMIT {
                    let total = text.len();
                    // The cap is in bytes; back off to a char boundary so
                    // a multi-byte character at the limit never splits.
                    let mut cut = READ_LIMIT;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    text.push_str(&format!("\n...[truncated, {total} bytes total]"));
                }
                ToolOutput::ok(&call.id, text)
            }
            Err(e) => ToolOutput::err(&call.id, format!("read {path}: {e}")),
        }
    }
}
