// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

/// Resolve the foreman home directory.
///
/// Priority: the `--home` CLI override, then `FOREMAN_HOME`, then
/// `~/.foreman`.  Falls back to `.foreman` in the working directory when
/// no home directory can be determined.
pub fn home_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(p) = cli_override {
        return p.to_path_buf();
    }
    if let Ok(env) = std::env::var("FOREMAN_HOME") {
        if !env.is_empty() {
            return PathBuf::from(env);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".foreman"))
        .unwrap_or_else(|| PathBuf::from(".foreman"))
}

/// Path of the shared SQLite store inside the foreman home.
pub fn store_path(cli_override: Option<&Path>) -> PathBuf {
    home_dir(cli_override).join("store.db")
}

/// Directory for per-session JSONL conversation logs.
pub fn logs_dir(cli_override: Option<&Path>) -> PathBuf {
    home_dir(cli_override).join("logs")
}
