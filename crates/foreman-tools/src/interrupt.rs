// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide interrupt flag.
//!
//! Raised by the signal handler and by `TurnExecutor::cancel()`; consulted
//! cooperatively by the session loop between rounds, by long-running tool
//! handlers, and by the dispatch pipeline between calls.  Cleared at the
//! start of each new turn.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Raise the process-wide interrupt flag.
pub fn raise_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear the flag (called when a new turn starts).
pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Whether an interrupt has been requested.
pub fn interrupt_requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
