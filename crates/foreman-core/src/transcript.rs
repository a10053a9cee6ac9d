// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use foreman_model::Message;
use tracing::warn;

/// Append-only JSONL log of a session's conversation.
///
/// One serialized [`Message`] per line under
/// `$FOREMAN_HOME/logs/<session-id>.jsonl`.  Logging failures are
/// reported and swallowed; a broken log never affects the turn.
pub struct Transcript {
    path: PathBuf,
    file: Mutex<File>,
}

impl Transcript {
    pub fn create(logs_dir: &Path, session_id: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join(format!("{session_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, msg: &Message) {
        let line = match serde_json::to_string(msg) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialize transcript message");
                return;
            }
        };
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, path = %self.path.display(), "transcript write failed");
        }
    }
}
