// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The turn executor: one background worker per active turn, with an
//! interruptible, event-notified lifecycle.
//!
//! State machine: `Idle → Running → (Completed | Errored | Interrupted) →
//! Idle`.  Exactly one worker may be alive at a time; `start` refuses
//! while a previous worker has not been joined, and `shutdown` always
//! joins — the worker handle is owned, never detached.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use foreman_tools::interrupt::{clear_interrupt, raise_interrupt};

use crate::events::AgentEvent;
use crate::notify::{AsyncEvent, EventPipe};
use crate::session::{ProcessOptions, Session, TurnOutcome};

pub struct TurnExecutor {
    session: Arc<Mutex<Session>>,
    pipe: Arc<EventPipe>,
    running: Arc<AtomicBool>,
    cancel_requested: Arc<AtomicBool>,
    handle: Option<tokio::task::JoinHandle<()>>,
    last: Arc<std::sync::Mutex<(TurnOutcome, Option<String>)>>,
    done: Arc<Notify>,
}

impl TurnExecutor {
    pub fn new(session: Session) -> anyhow::Result<Self> {
        let pipe = Arc::new(EventPipe::new()?);
        // Sub-agent spawn pokes the pipe through the services bundle's
        // weak handle; register before the session is shared.
        session.services().set_notify(&pipe);
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            pipe,
            running: Arc::new(AtomicBool::new(false)),
            cancel_requested: Arc::new(AtomicBool::new(false)),
            handle: None,
            last: Arc::new(std::sync::Mutex::new((TurnOutcome::Ok, None))),
            done: Arc::new(Notify::new()),
        })
    }

    /// Shared handle to the underlying session.  Locked by the worker for
    /// the duration of a turn — the single-turn invariant makes every
    /// other access (between turns) uncontended.
    pub fn session(&self) -> Arc<Mutex<Session>> {
        self.session.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Read end of the event pipe, for the REPL's select loop.
    pub fn notify_fd(&self) -> RawFd {
        self.pipe.notify_fd()
    }

    /// Read one queued event byte, if any.
    pub fn process_events(&self) -> Option<AsyncEvent> {
        self.pipe.recv()
    }

    /// Await the next event byte for at most `timeout`.
    pub async fn next_event(&self, timeout: Duration) -> Option<AsyncEvent> {
        self.pipe.wait_timeout(timeout).await
    }

    /// Request cooperative cancellation of the running turn.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        raise_interrupt();
    }

    /// Start processing `message` on a background worker.  Returns
    /// immediately; completion is signalled with one terminal event byte.
    pub async fn start(
        &mut self,
        message: String,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        self.start_with(message, ProcessOptions::default(), tx).await
    }

    pub async fn start_with(
        &mut self,
        message: String,
        opts: ProcessOptions,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        if self.running.load(Ordering::SeqCst) {
            anyhow::bail!("a turn is already running");
        }
        // Join the previous (finished) worker before starting a new one.
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }

        clear_interrupt();
        self.cancel_requested.store(false, Ordering::SeqCst);
        // Set before the spawn so a racing is_running() observes the
        // transition exactly once.
        self.running.store(true, Ordering::SeqCst);

        let session = self.session.clone();
        let pipe = self.pipe.clone();
        let running = self.running.clone();
        let cancel = self.cancel_requested.clone();
        let last = self.last.clone();
        let done = self.done.clone();

        self.handle = Some(tokio::spawn(async move {
            let mut guard = session.lock().await;
            let outcome = guard.process(&message, opts, tx, &cancel).await;
            let error = guard.last_error.clone();
            drop(guard);

            *last.lock().unwrap() = (outcome, error);
            let byte = match outcome {
                TurnOutcome::Ok => AsyncEvent::Complete,
                TurnOutcome::Cancelled => AsyncEvent::Interrupted,
                TurnOutcome::Failure | TurnOutcome::ContextExhausted => AsyncEvent::Error,
            };
            // The terminal byte is written before Running drops so a
            // reader that observes Idle always finds the byte queued.
            let _ = pipe.send(byte);
            running.store(false, Ordering::SeqCst);
            done.notify_waiters();
            debug!(outcome = ?outcome, "turn worker finished");
        }));
        Ok(())
    }

    /// Block until the worker signals completion, up to `timeout`.
    /// Returns `true` when the turn finished within the bound.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return true;
            }
            let remaining = deadline - tokio::time::Instant::now();
            if remaining.is_zero() {
                return false;
            }
            tokio::select! {
                _ = self.done.notified() => {}
                _ = tokio::time::sleep(remaining) => return !self.running.load(Ordering::SeqCst),
            }
        }
    }

    /// Result code of the last completed turn.
    pub fn result(&self) -> TurnOutcome {
        self.last.lock().unwrap().0
    }

    /// Error detail of the last completed turn, if it failed.
    pub fn error(&self) -> Option<String> {
        self.last.lock().unwrap().1.clone()
    }

    /// Cancel and join the worker.  The executor is reusable afterwards.
    pub async fn shutdown(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.cancel();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TurnExecutor {
    fn drop(&mut self) {
        // The owning caller is expected to shutdown().await first; abort
        // is the last resort when that contract was skipped.
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                warn!("turn executor dropped while running; aborting worker");
                handle.abort();
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalGate, AutoDenyPrompt};
    use crate::dispatch::Dispatcher;
    use crate::services::Services;
    use foreman_config::{AgentConfig, ToolsConfig};
    use foreman_model::ScriptedMockProvider;
    use foreman_tools::ToolRegistry;

    fn executor_with(model: ScriptedMockProvider) -> TurnExecutor {
        let gate = Arc::new(ApprovalGate::new(
            &ToolsConfig {
                yolo: true,
                ..Default::default()
            },
            Arc::new(AutoDenyPrompt),
        ));
        let dispatcher = Dispatcher::new(Arc::new(ToolRegistry::new()), gate);
        let session = Session::new(
            Arc::new(model),
            dispatcher,
            Arc::new(AgentConfig::default()),
            Arc::new(Services::new(None)),
        );
        TurnExecutor::new(session).unwrap()
    }

    #[tokio::test]
    async fn completed_turn_emits_c_byte_before_idle() {
        let _guard = crate::test_sync::lock();
        let mut ex = executor_with(ScriptedMockProvider::always_text("hi"));
        let (tx, _rx) = mpsc::channel(64);
        ex.start("hello".into(), tx).await.unwrap();
        assert!(ex.wait(Duration::from_secs(5)).await);
        // Running is false, so the terminal byte must already be queued.
        assert_eq!(ex.process_events(), Some(AsyncEvent::Complete));
        assert_eq!(ex.result(), TurnOutcome::Ok);
    }

    #[tokio::test]
    async fn failed_turn_emits_e_byte_and_error() {
        let _guard = crate::test_sync::lock();
        let mut ex = executor_with(ScriptedMockProvider::always_fail("connection refused"));
        let (tx, _rx) = mpsc::channel(64);
        ex.start("hello".into(), tx).await.unwrap();
        assert!(ex.wait(Duration::from_secs(5)).await);
        assert_eq!(ex.process_events(), Some(AsyncEvent::Error));
        assert_eq!(ex.result(), TurnOutcome::Failure);
        assert!(ex.error().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn start_refuses_while_running() {
        let _guard = crate::test_sync::lock();
        // A provider that never finishes within the test would hang; use
        // the always_text provider but check the refusal window by
        // starting twice back-to-back before the worker can finish.
        let mut ex = executor_with(ScriptedMockProvider::always_text("hi"));
        let (tx, _rx) = mpsc::channel(64);
        ex.start("one".into(), tx.clone()).await.unwrap();
        // If the first worker is still running, the second start errors;
        // if it already finished, the second start succeeds.  Either way
        // there is never more than one live worker.
        let second = ex.start("two".into(), tx).await;
        if ex.is_running() {
            assert!(second.is_err() || ex.wait(Duration::from_secs(5)).await);
        }
        assert!(ex.wait(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn executor_is_reusable_across_turns() {
        let _guard = crate::test_sync::lock();
        let mut ex = executor_with(ScriptedMockProvider::new(vec![
            vec![
                foreman_model::ResponseEvent::TextDelta("one".into()),
                foreman_model::ResponseEvent::Done,
            ],
            vec![
                foreman_model::ResponseEvent::TextDelta("two".into()),
                foreman_model::ResponseEvent::Done,
            ],
        ]));
        let (tx, _rx) = mpsc::channel(64);
        ex.start("a".into(), tx.clone()).await.unwrap();
        assert!(ex.wait(Duration::from_secs(5)).await);
        ex.start("b".into(), tx).await.unwrap();
        assert!(ex.wait(Duration::from_secs(5)).await);

        let session = ex.session();
        let guard = session.lock().await;
        let assistant_texts: Vec<&str> = guard
            .messages
            .iter()
            .filter(|m| m.role == foreman_model::Role::Assistant)
            .filter_map(|m| m.as_text())
            .collect();
        assert_eq!(assistant_texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn shutdown_joins_the_worker() {
        let _guard = crate::test_sync::lock();
        let mut ex = executor_with(ScriptedMockProvider::always_text("hi"));
        let (tx, _rx) = mpsc::channel(64);
        ex.start("hello".into(), tx).await.unwrap();
        ex.shutdown().await;
        assert!(!ex.is_running());
    }

    #[tokio::test]
    async fn cancel_before_start_yields_interrupted() {
        let _guard = crate::test_sync::lock();
        let mut ex = executor_with(ScriptedMockProvider::always_text("hi"));
        let (tx, _rx) = mpsc::channel(64);
        ex.start("hello".into(), tx).await.unwrap();
        ex.cancel();
        assert!(ex.wait(Duration::from_secs(5)).await);
        // Depending on timing the turn either completed first or was
        // cancelled; both terminal bytes are legal, but the state machine
        // must be Idle with a queued byte.
        assert!(!ex.is_running());
        assert!(ex.process_events().is_some());
        foreman_tools::interrupt::clear_interrupt();
    }
}
