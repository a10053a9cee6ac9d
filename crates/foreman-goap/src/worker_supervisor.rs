// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Parent-side bookkeeping for work-queue worker processes.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::worker::ENV_NOTIFY_FD;

/// Grace between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

pub struct WorkerHandle {
    pub id: String,
    pub pid: u32,
    pub queue: String,
    pub spawned_at: Instant,
    /// Updated whenever the parent observes the child alive.
    pub last_seen: Instant,
    pub status: WorkerStatus,
    child: Child,
}

/// Spawns and tracks worker child processes bound to a queue.
pub struct WorkerSupervisor {
    workers: HashMap<String, WorkerHandle>,
    /// Write end of the owning loop's event pipe, inherited by children
    /// so a finished work item pokes the supervisor awake.
    notify_fd: Option<RawFd>,
    home: Option<std::path::PathBuf>,
}

impl WorkerSupervisor {
    pub fn new(notify_fd: Option<RawFd>, home: Option<std::path::PathBuf>) -> Self {
        Self {
            workers: HashMap::new(),
            notify_fd,
            home,
        }
    }

    /// Fork a worker child servicing `queue` (re-executes this binary in
    /// worker mode).  Returns the worker id.
    pub fn spawn(&mut self, queue: &str) -> anyhow::Result<String> {
        let exe = std::env::current_exe().context("resolving current executable")?;
        let id = format!("worker-{}", &uuid::Uuid::new_v4().to_string()[..8]);

        let mut cmd = Command::new(exe);
        cmd.arg("--mode")
            .arg("worker")
            .arg("--queue")
            .arg(queue)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(home) = &self.home {
            cmd.arg("--home").arg(home);
        }
        if let Some(fd) = self.notify_fd {
            cmd.env(ENV_NOTIFY_FD, fd.to_string());
            // The pipe fds carry FD_CLOEXEC; re-enable inheritance for
            // this child only.
            unsafe {
                cmd.pre_exec(move || {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags >= 0 {
                        libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().context("spawning worker process")?;
        let pid = child.id().unwrap_or(0);
        debug!(id = %id, pid, queue, "spawned worker");
        self.workers.insert(
            id.clone(),
            WorkerHandle {
                id: id.clone(),
                pid,
                queue: queue.to_string(),
                spawned_at: Instant::now(),
                last_seen: Instant::now(),
                status: WorkerStatus::Running,
                child,
            },
        );
        Ok(id)
    }

    /// Check child liveness; refreshes the handle's heartbeat when alive.
    pub fn is_running(&mut self, id: &str) -> bool {
        match self.workers.get_mut(id) {
            Some(handle) => {
                refresh(handle);
                handle.status == WorkerStatus::Running
            }
            None => false,
        }
    }

    /// Update every handle's status from child liveness.
    pub fn reap(&mut self) {
        for handle in self.workers.values_mut() {
            refresh(handle);
        }
    }

    /// Number of live workers currently servicing `queue`.
    pub fn running_on_queue(&mut self, queue: &str) -> usize {
        self.reap();
        self.workers
            .values()
            .filter(|w| w.queue == queue && w.status == WorkerStatus::Running)
            .count()
    }

    /// Terminate a worker: SIGTERM, grace, then SIGKILL and reap.
    pub async fn stop(&mut self, id: &str) {
        if let Some(handle) = self.workers.get_mut(id) {
            if handle.status == WorkerStatus::Running {
                terminate_then_kill(&mut handle.child, handle.pid).await;
                handle.status = WorkerStatus::Failed;
            }
        }
    }

    /// Terminate every live worker (shutdown path).
    pub async fn stop_all(&mut self) {
        let ids: Vec<String> = self.workers.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }
}

fn refresh(handle: &mut WorkerHandle) {
    if handle.status != WorkerStatus::Running {
        return;
    }
    match handle.child.try_wait() {
        Ok(Some(exit)) => {
            handle.status = if exit.success() {
                WorkerStatus::Completed
            } else {
                WorkerStatus::Failed
            };
            debug!(id = %handle.id, status = ?handle.status, "worker exited");
        }
        Ok(None) => {
            handle.last_seen = Instant::now();
        }
        Err(e) => {
            warn!(id = %handle.id, error = %e, "worker liveness check failed");
            handle.status = WorkerStatus::Failed;
        }
    }
}

async fn terminate_then_kill(child: &mut Child, pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    tokio::time::sleep(KILL_GRACE).await;
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            let _ = child.kill().await;
        }
    }
    let _ = child.wait().await;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
