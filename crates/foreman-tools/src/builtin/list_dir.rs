// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolCall, ToolOutput};

#[derive(Default)]
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are suffixed with '/'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: cwd)" }
            },
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
            .unwrap_or(".")
            .to_string()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();

        let mut rd = match tokio::fs::read_dir(&path).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutput::err(&call.id, format!("list {path}: {e}")),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        ToolOutput::ok(&call.id, names.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn lists_files_and_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let out = ListDirTool
            .execute(&ToolCall {
                id: "t1".into(),
                name: "list_dir".into(),
                args: json!({"path": dir.path().display().to_string()}),
            })
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "a/\nb.txt");
    }

    #[tokio::test]
    async fn missing_directory_is_error() {
        let out = ListDirTool
            .execute(&ToolCall {
                id: "t1".into(),
                name: "list_dir".into(),
                args: json!({"path": "/nonexistent/dir"}),
            })
            .await;
        assert!(out.is_error);
    }
}
