// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::protected::ProtectedPaths;
use crate::tool::{Tool, ToolCall, ToolOutput};

pub struct WriteFileTool {
    pub protected: Arc<ProtectedPaths>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating it (and parent directories) if \
         needed and replacing any existing content. Protected paths are \
         refused."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Destination file path" },
                "content": { "type": "string", "description": "Full file content to write" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "write"
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
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'content' argument"),
        };

        if let Err(e) = self.protected.check_mutable(Path::new(&path)) {
            return e.into_output(&call.id);
        }

        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return ToolOutput::err(&call.id, format!("mkdir {}: {e}", parent.display()));
                }
            }
        }
        match tokio::fs::write(&path, &content).await {
            Ok(()) => ToolOutput::ok(&call.id, format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolOutput::err(&call.id, format!("write {path}: {e}")),
        }
    }
}
