// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The headless goal supervisor: drives one goal from creation to
//! Complete by reacting to worker completion notices.
//!
//! No stdin, no REPL — just the session turn loop fed by synthetic
//! messages, a completion-notice poller, and a periodic stall-guard tick.
//! Between two wake-ups, all pending notices are folded into one message
//! so the model sees a single consistent snapshot per turn.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use foreman_config::Config;
use foreman_core::{
    ApprovalGate, AutoDenyPrompt, Dispatcher, EventPipe, ProcessOptions, Services, Session,
    TurnOutcome,
};
use foreman_model::ModelProvider;
use foreman_store::{CompletionNotice, GoalStatus, Store};
use foreman_tools::ToolRegistry;

use crate::goap_tools::register_goap_tools;
use crate::worker_supervisor::WorkerSupervisor;

pub const SUPERVISOR_EXIT_COMPLETE: i32 = 0;
pub const SUPERVISOR_EXIT_ERROR: i32 = -1;
pub const SUPERVISOR_EXIT_CONTEXT: i32 = -3;

/// Consecutive failed turns tolerated before giving up.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

const SUPERVISOR_PROMPT: &str = "\
You are the goal supervisor of a multi-process agent runtime. You drive \
one goal to completion in two phases. Plan: break the goal into an \
ordered list of actions with goap_plan_actions. Execute: dispatch \
actions as work items with goap_dispatch_action (workers process them \
in the background), react to completion reports, and when every action \
is completed call goap_check_complete. Dispatch actions one at a time \
unless they are clearly independent. Keep responses short; your output \
is read by logs, not people.";

pub struct Supervisor {
    session: Session,
    store: Arc<Store>,
    goal_id: String,
    cfg: foreman_config::SupervisorConfig,
    pipe: Arc<EventPipe>,
    workers: Arc<Mutex<WorkerSupervisor>>,
    phase_hint: Option<String>,
}

impl Supervisor {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        store: Arc<Store>,
        goal_id: String,
        config: &Config,
        home: Option<std::path::PathBuf>,
    ) -> anyhow::Result<Self> {
        let pipe = Arc::new(EventPipe::new()?);
        let workers = Arc::new(Mutex::new(WorkerSupervisor::new(
            Some(pipe.write_raw_fd()),
            home,
        )));

        // The GOAP tools are the supervisor's own control surface; gating
        // them behind prompts would deadlock a headless process.
        let mut tools_cfg = config.tools.clone();
        tools_cfg.allow_categories.push("goap".into());
        let gate = Arc::new(ApprovalGate::new(&tools_cfg, Arc::new(AutoDenyPrompt)));

        let mut registry = ToolRegistry::new();
        register_goap_tools(
            &mut registry,
            store.clone(),
            goal_id.clone(),
            workers.clone(),
            config.supervisor.max_attempts,
        );

        let services = Arc::new(Services::new(Some(store.clone())));
        services.set_notify(&pipe);

        let session = Session::new(
            model,
            Dispatcher::new(Arc::new(registry), gate),
            Arc::new(config.agent.clone()),
            services,
        )
        .with_system_prompt(SUPERVISOR_PROMPT);

        Ok(Self {
            session,
            store,
            goal_id,
            cfg: config.supervisor.clone(),
            pipe,
            workers,
            phase_hint: None,
        })
    }

    /// Constrain the run to one phase (`--phase plan` / `--phase execute`).
    pub fn with_phase(mut self, phase: Option<&str>) -> Self {
        self.phase_hint = phase.map(|p| match p {
            "plan" => "Phase restriction: PLAN only. Plan the actions; do not dispatch any.".into(),
            "execute" => {
                "Phase restriction: EXECUTE only. The plan exists; dispatch and track it.".into()
            }
            other => format!("Phase restriction: {other}."),
        });
        self
    }

    /// The event pipe poked by workers; exposed so embedders (and tests)
    /// can wake the loop.
    pub fn event_pipe(&self) -> Arc<EventPipe> {
        self.pipe.clone()
    }

    /// Drive the goal to termination.  Returns the process exit code:
    /// `0` goal complete, `-1` error, `-3` context exhausted (respawn the
    /// supervisor; goal state persists in the store).
    pub async fn run(mut self) -> i32 {
        // Recover orphans left by a previous supervisor process: first
        // requeue items whose claiming worker is gone, then reconcile
        // actions against the settled item states.
        match self.store.requeue_orphaned_running(worker_owner_alive) {
            Ok(requeued) if !requeued.is_empty() => {
                info!(count = requeued.len(), "requeued items from dead workers");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan item sweep failed"),
        }
        match self.store.reconcile_running_actions(&self.goal_id) {
            Ok(changed) if !changed.is_empty() => {
                info!(goal = %self.goal_id, count = changed.len(), "reconciled orphaned actions");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "orphan reconciliation failed");
                return SUPERVISOR_EXIT_ERROR;
            }
        }

        let goal = match self.store.get_goal(&self.goal_id) {
            Ok(Some(g)) => g,
            _ => {
                warn!(goal = %self.goal_id, "goal not found");
                return SUPERVISOR_EXIT_ERROR;
            }
        };
        if goal.status == GoalStatus::Pending {
            let _ = self.store.set_goal_status(&self.goal_id, GoalStatus::Planning);
        }

        let mut failures = 0u32;
        let mut pending_msg = Some(self.state_prompt("The goal supervisor has started."));
        let tick = Duration::from_secs(self.cfg.tick_secs.max(1));

        loop {
            if let Some(msg) = pending_msg.take() {
                let (tx, _rx) = mpsc::channel(256);
                let cancel = AtomicBool::new(false);
                let outcome = self
                    .session
                    .process(&msg, ProcessOptions::default(), tx, &cancel)
                    .await;
                match outcome {
                    TurnOutcome::Ok => failures = 0,
                    TurnOutcome::ContextExhausted => {
                        info!(goal = %self.goal_id, "context exhausted; exiting for respawn");
                        self.shutdown().await;
                        return SUPERVISOR_EXIT_CONTEXT;
                    }
                    TurnOutcome::Cancelled => {
                        info!(goal = %self.goal_id, "supervisor interrupted");
                        self.shutdown().await;
                        return SUPERVISOR_EXIT_ERROR;
                    }
                    TurnOutcome::Failure => {
                        failures += 1;
                        warn!(failures, "supervisor turn failed");
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            self.shutdown().await;
                            return SUPERVISOR_EXIT_ERROR;
                        }
                        // Transient: retry on the next loop pass.
                        pending_msg =
                            Some(self.state_prompt("Retrying after a failed model turn."));
                        continue;
                    }
                }
            }

            // Termination: re-read the authoritative goal state.
            match self.store.get_goal(&self.goal_id) {
                Ok(Some(g)) if g.status == GoalStatus::Complete => {
                    info!(goal = %self.goal_id, "goal complete");
                    self.shutdown().await;
                    return SUPERVISOR_EXIT_COMPLETE;
                }
                Ok(Some(g)) if g.status == GoalStatus::Failed => {
                    warn!(goal = %self.goal_id, "goal failed");
                    self.shutdown().await;
                    return SUPERVISOR_EXIT_ERROR;
                }
                Ok(Some(_)) => {}
                _ => {
                    self.shutdown().await;
                    return SUPERVISOR_EXIT_ERROR;
                }
            }

            // Block on the notify pipe with the stall-guard timeout.
            let woke = self.pipe.wait_timeout(tick).await;
            self.pipe.drain();
            self.workers.lock().await.reap();

            // Coalesce everything that happened while the model thought.
            let notices = self.store.drain_notices().unwrap_or_default();
            let changed = self
                .store
                .reconcile_running_actions(&self.goal_id)
                .unwrap_or_default();

            if notices.is_empty() && changed.is_empty() {
                // Nothing new.  A pure timer wake re-prompts as a stall
                // guard unless auto messages are suppressed.
                if woke.is_none() && !self.cfg.no_auto_messages {
                    debug!("stall-guard re-prompt");
                    pending_msg = Some(self.state_prompt("Periodic status check."));
                }
                continue;
            }

            pending_msg = Some(self.notices_prompt(&notices));
        }
    }

    async fn shutdown(&mut self) {
        self.workers.lock().await.stop_all().await;
    }

    /// Snapshot of goal state as a synthetic user message.
    fn state_prompt(&self, heading: &str) -> String {
        let mut lines = vec![heading.to_string()];
        if let Some(hint) = &self.phase_hint {
            lines.push(hint.clone());
        }
        match self.store.get_goal(&self.goal_id) {
            Ok(Some(goal)) => {
                lines.push(format!("Goal [{}]: {}", goal.status.as_str(), goal.title));
            }
            _ => lines.push(format!("Goal {} (state unavailable)", self.goal_id)),
        }
        match self.store.list_actions(&self.goal_id) {
            Ok(actions) if actions.is_empty() => {
                lines.push("No actions planned yet. Plan the goal now.".into());
            }
            Ok(actions) => {
                lines.push("Actions:".into());
                for a in actions {
                    let mut line = format!("  {} [{}] {}", a.id, a.status.as_str(), a.title);
                    if let Some(wid) = &a.work_item_id {
                        if let Ok(Some(item)) = self.store.get_work_item(wid) {
                            if let Some(result) = &item.result {
                                line.push_str(&format!(" → {result}"));
                            }
                        }
                    }
                    lines.push(line);
                }
                lines.push("Continue executing the plan.".into());
            }
            Err(_) => lines.push("Actions unavailable.".into()),
        }
        lines.join("\n")
    }

    /// Fold a batch of completion notices into one synthetic message.
    fn notices_prompt(&self, notices: &[CompletionNotice]) -> String {
        let mut lines = vec!["Worker activity since the last update:".to_string()];
        for n in notices {
            let result = self
                .store
                .get_work_item(&n.work_item_id)
                .ok()
                .flatten()
                .and_then(|i| i.result)
                .unwrap_or_default();
            lines.push(format!(
                "  work item {} on '{}' is now {}: {}",
                n.work_item_id, n.queue, n.status, result
            ));
        }
        lines.push(String::new());
        lines.push(self.state_prompt("Current state:"));
        lines.join("\n")
    }
}

/// Liveness probe for a work-item claim owner.
///
/// Worker ids embed the worker's pid (`worker-<pid>`); kill(pid, 0)
/// answers whether that process still exists.  Owners in any other format
/// are assumed alive — never steal a claim that cannot be verified.
fn worker_owner_alive(owner: &str) -> bool {
    let Some(pid) = owner
        .strip_prefix("worker-")
        .and_then(|p| p.parse::<i32>().ok())
    else {
        return true;
    };
    unsafe { libc::kill(pid, 0) == 0 }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
