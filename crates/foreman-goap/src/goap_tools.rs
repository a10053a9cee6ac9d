// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The GOAP tool surface: handlers the supervisor's model uses to
//! manipulate goals, actions, and work items.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use foreman_store::{ActionStatus, GoalStatus, Store};
use foreman_tools::{Tool, ToolCall, ToolOutput, ToolRegistry};

use crate::worker_supervisor::WorkerSupervisor;

/// Register the full GOAP tool set for one goal on `reg`.
pub fn register_goap_tools(
    reg: &mut ToolRegistry,
    store: Arc<Store>,
    goal_id: String,
    workers: Arc<Mutex<WorkerSupervisor>>,
    max_attempts: u32,
) {
    reg.register(GoapPlanActionsTool {
        store: store.clone(),
        goal_id: goal_id.clone(),
    });
    reg.register(GoapDispatchActionTool {
        store: store.clone(),
        goal_id: goal_id.clone(),
        workers: workers.clone(),
        max_attempts,
    });
    reg.register(GoapSpawnWorkerTool { workers });
    reg.register(GoapCompleteActionTool {
        store: store.clone(),
    });
    reg.register(GoapFailActionTool {
        store: store.clone(),
    });
    reg.register(GoapCheckCompleteTool { store, goal_id });
}

// ── goap_plan_actions ─────────────────────────────────────────────────────────

pub struct GoapPlanActionsTool {
    pub store: Arc<Store>,
    pub goal_id: String,
}

#[async_trait]
impl Tool for GoapPlanActionsTool {
    fn name(&self) -> &str {
        "goap_plan_actions"
    }

    fn description(&self) -> &str {
        "Append an ordered list of actions to the goal's plan and mark the \
         goal ready for execution. Call once with the complete plan."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "actions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Action descriptions, in execution order"
                }
            },
            "required": ["actions"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "goap"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(actions) = call.args.get("actions").and_then(|v| v.as_array()) else {
            return ToolOutput::err(&call.id, "missing 'actions' argument");
        };
        let titles: Vec<&str> = actions.iter().filter_map(|v| v.as_str()).collect();
        if titles.is_empty() {
            return ToolOutput::err(&call.id, "'actions' must contain at least one entry");
        }
        let mut lines = Vec::with_capacity(titles.len());
        for title in titles {
            match self.store.add_action(&self.goal_id, title) {
                Ok(id) => lines.push(format!("{id}  {title}")),
                Err(e) => return ToolOutput::err(&call.id, format!("adding action: {e}")),
            }
        }
        if let Err(e) = self.store.set_goal_status(&self.goal_id, GoalStatus::Ready) {
            return ToolOutput::err(&call.id, format!("updating goal: {e}"));
        }
        debug!(goal = %self.goal_id, count = lines.len(), "actions planned");
        ToolOutput::ok(&call.id, format!("planned {} action(s):\n{}", lines.len(), lines.join("\n")))
    }
}

// ── goap_dispatch_action ──────────────────────────────────────────────────────

pub struct GoapDispatchActionTool {
    pub store: Arc<Store>,
    pub goal_id: String,
    pub workers: Arc<Mutex<WorkerSupervisor>>,
    pub max_attempts: u32,
}

#[async_trait]
impl Tool for GoapDispatchActionTool {
    fn name(&self) -> &str {
        "goap_dispatch_action"
    }

    fn description(&self) -> &str {
        "Turn a planned action into a work item on the named queue and \
         bind them together. Spawns a worker for the queue unless one is \
         already running (set spawn_worker=false to suppress)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action_id": { "type": "string", "description": "Action to dispatch" },
                "queue": { "type": "string", "description": "Target work queue" },
                "spawn_worker": {
                    "type": "boolean",
                    "description": "Ensure a worker services the queue (default true)"
                }
            },
            "required": ["action_id", "queue"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "goap"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(action_id) = call.args.get("action_id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'action_id' argument");
        };
        let Some(queue) = call.args.get("queue").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'queue' argument");
        };
        let spawn_worker = call
            .args
            .get("spawn_worker")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let action = match self.store.get_action(action_id) {
            Ok(Some(a)) if a.goal_id == self.goal_id => a,
            Ok(Some(_)) => {
                return ToolOutput::err(&call.id, "action belongs to a different goal")
            }
            Ok(None) => return ToolOutput::err(&call.id, format!("unknown action: {action_id}")),
            Err(e) => return ToolOutput::err(&call.id, format!("loading action: {e}")),
        };

        let item_id = match self.store.enqueue(queue, &action.title, self.max_attempts) {
            Ok(id) => id,
            Err(e) => return ToolOutput::err(&call.id, format!("enqueue: {e}")),
        };
        if let Err(e) = self.store.bind_action_work_item(action_id, &item_id) {
            return ToolOutput::err(&call.id, format!("binding action: {e}"));
        }
        let _ = self.store.set_goal_status(&self.goal_id, GoalStatus::Running);

        let mut spawned = String::new();
        if spawn_worker {
            let mut workers = self.workers.lock().await;
            if workers.running_on_queue(queue) == 0 {
                match workers.spawn(queue) {
                    Ok(wid) => spawned = format!("; spawned {wid}"),
                    Err(e) => {
                        return ToolOutput::err(
                            &call.id,
                            format!("work item {item_id} enqueued but worker spawn failed: {e}"),
                        )
                    }
                }
            }
        }
        ToolOutput::ok(
            &call.id,
            format!("dispatched action {action_id} as work item {item_id} on '{queue}'{spawned}"),
        )
    }
}

// ── goap_spawn_worker ─────────────────────────────────────────────────────────

pub struct GoapSpawnWorkerTool {
    pub workers: Arc<Mutex<WorkerSupervisor>>,
}

#[async_trait]
impl Tool for GoapSpawnWorkerTool {
    fn name(&self) -> &str {
        "goap_spawn_worker"
    }

    fn description(&self) -> &str {
        "Spawn an additional worker process servicing the named queue."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "queue": { "type": "string", "description": "Queue the worker services" }
            },
            "required": ["queue"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "goap"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(queue) = call.args.get("queue").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'queue' argument");
        };
        match self.workers.lock().await.spawn(queue) {
            Ok(id) => ToolOutput::ok(&call.id, format!("spawned {id} on '{queue}'")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ── goap_complete_action / goap_fail_action ───────────────────────────────────

pub struct GoapCompleteActionTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for GoapCompleteActionTool {
    fn name(&self) -> &str {
        "goap_complete_action"
    }

    fn description(&self) -> &str {
        "Mark an action completed (work done outside the queue, or \
         manual override)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action_id": { "type": "string" }
            },
            "required": ["action_id"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "goap"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(action_id) = call.args.get("action_id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'action_id' argument");
        };
        match self.store.set_action_status(action_id, ActionStatus::Completed) {
            Ok(()) => ToolOutput::ok(&call.id, format!("action {action_id} completed")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

pub struct GoapFailActionTool {
    pub store: Arc<Store>,
}

#[async_trait]
impl Tool for GoapFailActionTool {
    fn name(&self) -> &str {
        "goap_fail_action"
    }

    fn description(&self) -> &str {
        "Mark an action failed (unrecoverable; the goal cannot proceed \
         through it)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action_id": { "type": "string" }
            },
            "required": ["action_id"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> &str {
        "goap"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(action_id) = call.args.get("action_id").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'action_id' argument");
        };
        match self.store.set_action_status(action_id, ActionStatus::Failed) {
            Ok(()) => ToolOutput::ok(&call.id, format!("action {action_id} failed")),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

// ── goap_check_complete ───────────────────────────────────────────────────────

pub struct GoapCheckCompleteTool {
    pub store: Arc<Store>,
    pub goal_id: String,
}

#[async_trait]
impl Tool for GoapCheckCompleteTool {
    fn name(&self) -> &str {
        "goap_check_complete"
    }

    fn description(&self) -> &str {
        "Check whether every planned action is completed; if so, mark the \
         goal complete. Reports remaining actions otherwise."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "additionalProperties": false })
    }

    fn category(&self) -> &str {
        "goap"
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let actions = match self.store.list_actions(&self.goal_id) {
            Ok(a) => a,
            Err(e) => return ToolOutput::err(&call.id, e.to_string()),
        };
        if actions.is_empty() {
            return ToolOutput::err(&call.id, "goal has no planned actions yet");
        }
        let remaining: Vec<String> = actions
            .iter()
            .filter(|a| a.status != ActionStatus::Completed)
            .map(|a| format!("{} [{}] {}", a.id, a.status.as_str(), a.title))
            .collect();
        if remaining.is_empty() {
            if let Err(e) = self.store.set_goal_status(&self.goal_id, GoalStatus::Complete) {
                return ToolOutput::err(&call.id, e.to_string());
            }
            ToolOutput::ok(&call.id, "goal complete")
        } else {
            ToolOutput::ok(
                &call.id,
                format!("{} action(s) remaining:\n{}", remaining.len(), remaining.join("\n")),
            )
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
