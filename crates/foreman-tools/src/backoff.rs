// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Denials within the window before the auto-deny backoff engages.
const DENIALS_BEFORE_BACKOFF: u32 = 3;
/// Base backoff once engaged; doubles with each further denial.
const BASE_BACKOFF: Duration = Duration::from_secs(30);

/// Per-session denial rate limiter keyed by tool name (or category).
///
/// Repeated denials of the same key within a sliding window engage an
/// exponentially growing backoff: while it is active, prompts for that key
/// are auto-denied without asking the user.  An explicit approval resets
/// the key.
#[derive(Debug)]
pub struct DenialBackoff {
    window: Duration,
    state: Mutex<HashMap<String, KeyState>>,
}

#[derive(Debug, Clone)]
struct KeyState {
    denials: u32,
    window_start: Instant,
    backoff_until: Option<Instant>,
}

impl DenialBackoff {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Whether prompts for `key` are currently auto-denied.
    pub fn is_blocked(&self, key: &str) -> bool {
        self.is_blocked_at(key, Instant::now())
    }

    fn is_blocked_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.get(key) {
            Some(ks) => match ks.backoff_until {
                Some(until) if now < until => true,
                Some(_) => {
                    // Backoff expired: the next call prompts again.
                    state.remove(key);
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    /// Record a user denial for `key`.
    pub fn record_denial(&self, key: &str) {
        self.record_denial_at(key, Instant::now())
    }

    fn record_denial_at(&self, key: &str, now: Instant) {
        let mut state = self.state.lock().unwrap();
        let ks = state.entry(key.to_string()).or_insert(KeyState {
            denials: 0,
            window_start: now,
            backoff_until: None,
        });
        // Denials outside the window start a fresh count.
        if now.duration_since(ks.window_start) > self.window {
            ks.denials = 0;
            ks.window_start = now;
            ks.backoff_until = None;
        }
        ks.denials += 1;
        if ks.denials >= DENIALS_BEFORE_BACKOFF {
            let exp = ks.denials - DENIALS_BEFORE_BACKOFF;
            let backoff = BASE_BACKOFF * 2u32.saturating_pow(exp);
            ks.backoff_until = Some(now + backoff);
            debug!(key, denials = ks.denials, ?backoff, "denial backoff engaged");
        }
    }

    /// An explicit approval resets the denial counter for `key`.
    pub fn reset(&self, key: &str) {
        self.state.lock().unwrap().remove(key);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
