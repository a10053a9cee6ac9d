// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool dispatch pipeline: lookup → argument validation → approval gate →
//! execution → result capture.
//!
//! Every parsed tool call produces exactly one [`ToolOutput`]; every
//! failure class maps to an error output — nothing here aborts the turn.

use std::sync::Arc;

use tracing::debug;

use foreman_tools::interrupt::interrupt_requested;
use foreman_tools::schema::validate_args;
use foreman_tools::{ToolCall, ToolError, ToolOutput, ToolRegistry};

use crate::approval::ApprovalGate;

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, gate: Arc<ApprovalGate>) -> Self {
        Self { registry, gate }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run one tool call through the full pipeline.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutput {
        // 1. Lookup
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolError::UnknownTool(call.name.clone()).into_output(&call.id);
        };

        // 2. Argument validation against the declared schema — the single
        //    place argument shape is checked; handlers receive parsed JSON.
        if let Err(msg) = validate_args(&tool.parameters_schema(), &call.args) {
            return ToolError::BadArguments(msg).into_output(&call.id);
        }

        // 3./4. Approval gate (allowlist → backoff → prompt)
        let summary = tool.approval_summary(call);
        if let Err(e) = self.gate.check(tool.name(), &summary, tool.category()).await {
            return e.into_output(&call.id);
        }

        // Interrupt observed between gate and execution counts as a
        // cancelled call, not a started one.
        if interrupt_requested() {
            return ToolError::Interrupted.into_output(&call.id);
        }

        debug!(tool = %call.name, call_id = %call.id, "executing tool");

        // 5. Execution
        let mut output = tool.execute(call).await;
        // 7. Result capture: the output always carries the matching id.
        output.call_id = call.id.clone();
        output
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
