// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Worker mode: a dedicated session that loops claiming work items from a
//! named queue, processes each as a synthetic user message, and records
//! the outcome back on the queue.

use std::os::fd::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use foreman_core::{notify, AsyncEvent, ProcessOptions, Session};
use foreman_model::Role;
use foreman_store::Store;
use foreman_tools::interrupt::interrupt_requested;

/// Environment variable carrying the inherited notify-pipe write fd.
pub const ENV_NOTIFY_FD: &str = "FOREMAN_NOTIFY_FD";

pub struct WorkerOptions {
    pub queue: String,
    pub worker_id: String,
    /// Exit after this long with no claimable work.
    pub idle_timeout: Duration,
    /// Write end of the parent supervisor's event pipe, if inherited.
    pub notify_fd: Option<RawFd>,
}

impl WorkerOptions {
    /// Build from CLI/env: generates a worker id and reads
    /// [`ENV_NOTIFY_FD`] when the parent passed one down.
    pub fn from_env(queue: String, idle_timeout: Duration) -> Self {
        let notify_fd = std::env::var(ENV_NOTIFY_FD)
            .ok()
            .and_then(|s| s.parse::<RawFd>().ok());
        Self {
            queue,
            worker_id: format!("worker-{}", std::process::id()),
            idle_timeout,
            notify_fd,
        }
    }
}

/// Claim/process/record loop.  Returns the process exit code:
/// `0` after a clean idle-timeout or interrupt exit, `1` when the session
/// ran out of context (the parent may respawn a fresh worker).
pub async fn run_worker(
    mut session: Session,
    store: Arc<Store>,
    opts: WorkerOptions,
) -> anyhow::Result<i32> {
    info!(queue = %opts.queue, worker = %opts.worker_id, "worker started");
    let mut last_work = Instant::now();

    loop {
        if interrupt_requested() {
            info!(worker = %opts.worker_id, "worker interrupted; exiting");
            return Ok(0);
        }

        let item = match store.claim(&opts.queue, &opts.worker_id)? {
            Some(item) => item,
            None => {
                if last_work.elapsed() >= opts.idle_timeout {
                    info!(worker = %opts.worker_id, "idle timeout; exiting");
                    return Ok(0);
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };
        last_work = Instant::now();

        debug!(item = %item.id, "processing work item");
        let message = format!(
            "Work item {} from queue '{}':\n{}",
            item.id, item.queue, item.payload
        );
        // Headless: nobody reads the event stream.
        let (tx, _rx) = mpsc::channel(256);
        let cancel = AtomicBool::new(false);
        let outcome = session
            .process(&message, ProcessOptions::default(), tx, &cancel)
            .await;

        if outcome.is_ok() {
            let result = session
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant && m.as_text().is_some())
                .and_then(|m| m.as_text())
                .unwrap_or("done")
                .to_string();
            store.complete_work_item(&item.id, &result)?;
        } else {
            warn!(item = %item.id, code = outcome.code(), "work item failed");
            store.fail_work_item(&item.id, &format!("turn failed with code {}", outcome.code()))?;
        }

        // Record the completion notice with the item's settled status so
        // the supervisor sees retries as pending, not failed.
        if let Some(settled) = store.get_work_item(&item.id)? {
            store.record_notice(&item.id, &item.queue, settled.status.as_str())?;
        }
        if let Some(fd) = opts.notify_fd {
            let _ = notify::send_to_fd(fd, AsyncEvent::Complete);
        }

        if outcome == foreman_core::TurnOutcome::ContextExhausted {
            warn!(worker = %opts.worker_id, "context exhausted; exiting for respawn");
            return Ok(1);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
