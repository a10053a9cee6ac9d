// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Byte-tagged wake-up pipe shared by the turn executor, the sub-agent
//! manager, worker processes, and the supervisor loop.
//!
//! Each event kind is one ASCII byte; two identical queued bytes are
//! indistinguishable from one, and readers always re-query authoritative
//! state after waking, so a dropped write against a full pipe buffer is
//! harmless.  Both ends are non-blocking, which lets the read end sit in
//! any `select`/`poll` loop and the write end be poked from any thread or
//! child process.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::warn;

/// Single-byte event tags.  Reserved range: uppercase ASCII letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    /// Turn completed successfully
    Complete,
    /// Turn failed
    Error,
    /// Turn was interrupted / cancelled
    Interrupted,
    /// A sub-agent needs an approval decision
    ApprovalNeeded,
    /// A sub-agent was spawned (advisory re-poke, no state transition)
    SubAgentSpawned,
}

impl AsyncEvent {
    pub fn byte(&self) -> u8 {
        match self {
            Self::Complete => b'C',
            Self::Error => b'E',
            Self::Interrupted => b'I',
            Self::ApprovalNeeded => b'A',
            Self::SubAgentSpawned => b'S',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'C' => Some(Self::Complete),
            b'E' => Some(Self::Error),
            b'I' => Some(Self::Interrupted),
            b'A' => Some(Self::ApprovalNeeded),
            b'S' => Some(Self::SubAgentSpawned),
            _ => None,
        }
    }
}

/// Non-blocking OS pipe carrying [`AsyncEvent`] bytes.
pub struct EventPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl EventPipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_nonblocking(read.as_raw_fd())?;
        set_nonblocking(write.as_raw_fd())?;
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
        Ok(Self { read, write })
    }

    /// Write one event byte.
    ///
    /// A `WouldBlock` (full pipe buffer) counts as success: an identical
    /// byte is already queued and the reader re-queries state on wake.
    /// A broken pipe is reported but must not abort the sender's work.
    pub fn send(&self, ev: AsyncEvent) -> io::Result<()> {
        send_to_fd(self.write.as_raw_fd(), ev)
    }

    /// Read the next queued event byte, if any.
    pub fn recv(&self) -> Option<AsyncEvent> {
        let mut byte = [0u8; 1];
        let n = unsafe {
            libc::read(
                self.read.as_raw_fd(),
                byte.as_mut_ptr() as *mut libc::c_void,
                1,
            )
        };
        if n == 1 {
            AsyncEvent::from_byte(byte[0])
        } else {
            None
        }
    }

    /// Read and discard all queued bytes.
    pub fn drain(&self) {
        while self.recv().is_some() {}
    }

    /// Read end, for integration with an external `select`/`poll` loop.
    pub fn notify_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Write end, for passing to child processes (workers poke their
    /// parent supervisor through it).
    pub fn write_raw_fd(&self) -> RawFd {
        self.write.as_raw_fd()
    }

    /// Await the next event for at most `timeout`.
    ///
    /// Events are advisory wake-ups, not state, so a coarse 25ms poll
    /// granularity is sufficient for every consumer (the REPL redraw and
    /// the supervisor's 10s tick).
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<AsyncEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(ev) = self.recv() {
                return Some(ev);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Write one event byte to a raw fd (used by worker children against the
/// inherited notify fd).  Same drop semantics as [`EventPipe::send`].
pub fn send_to_fd(fd: RawFd, ev: AsyncEvent) -> io::Result<()> {
    let byte = [ev.byte()];
    let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    if n == 1 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(());
    }
    warn!(error = %err, "event pipe write failed");
    Err(err)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
