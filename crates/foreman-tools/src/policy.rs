// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::Regex;

use foreman_config::ToolsConfig;

/// Compiled allowlist consulted by the approval gate before any prompt.
///
/// Entries come from config and the repeatable `--allow` / `--allow-category`
/// CLI flags:
/// - `tool` — every call to that tool is pre-approved
/// - `tool:pattern` — calls whose argument summary matches the glob pattern
/// - category names — every tool declaring that category is pre-approved
#[derive(Debug)]
pub struct AllowList {
    /// (tool name, optional summary pattern)
    entries: Vec<(String, Option<Regex>)>,
    categories: Vec<String>,
}

impl AllowList {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self::new(&cfg.allow, &cfg.allow_categories)
    }

    pub fn new(allow: &[String], categories: &[String]) -> Self {
        let entries = allow
            .iter()
            .map(|entry| match entry.split_once(':') {
                Some((tool, pattern)) => (tool.to_string(), glob_to_regex(pattern)),
                None => (entry.clone(), None),
            })
            .collect();
        Self {
            entries,
            categories: categories.to_vec(),
        }
    }

    /// Whether a call to `tool` with the given argument summary is
    /// pre-approved without prompting.
    pub fn allows(&self, tool: &str, summary: &str, category: &str) -> bool {
        if self.categories.iter().any(|c| c == category) {
            return true;
        }
        for (name, pattern) in &self.entries {
            if name != tool {
                continue;
            }
            match pattern {
                None => return true,
                Some(re) if re.is_match(summary) => return true,
                Some(_) => {}
            }
        }
        false
    }
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
