// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex, Weak};

use foreman_store::Store;

use crate::notify::{AsyncEvent, EventPipe};

/// Bundle of shared services injected into every session.
///
/// Nothing in the core reaches for a process-wide global: the store and
/// the wake-up pipe both travel through this bundle.  The pipe is held
/// weakly — it is owned by the turn executor (or supervisor loop), and a
/// notification after that owner is gone silently no-ops.
#[derive(Default)]
pub struct Services {
    /// Shared SQLite store (work queue, goals, notices).  `None` for
    /// sessions that never touch persistent state (plain interactive use).
    pub store: Option<Arc<Store>>,
    notify: Mutex<Weak<EventPipe>>,
}

impl Services {
    pub fn new(store: Option<Arc<Store>>) -> Self {
        Self {
            store,
            notify: Mutex::new(Weak::new()),
        }
    }

    /// Register the event pipe to poke on notifications.
    pub fn set_notify(&self, pipe: &Arc<EventPipe>) {
        *self.notify.lock().unwrap() = Arc::downgrade(pipe);
    }

    /// Poke the registered pipe.  No-op when the owner is gone.
    pub fn notify_event(&self, ev: AsyncEvent) {
        if let Some(pipe) = self.notify.lock().unwrap().upgrade() {
            let _ = pipe.send(ev);
        }
    }
}
