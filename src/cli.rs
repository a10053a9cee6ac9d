// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Run mode of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Mode {
    /// Line-oriented REPL over the turn executor.
    #[default]
    Interactive,
    /// One prompt, one turn, exit with the turn's result code.
    SingleShot,
    /// Sub-agent entry point: like single-shot, but honours the approval
    /// proxy channel handed down by the parent.
    Background,
    /// Loop claiming work items from --queue until idle.
    Worker,
    /// Headless goal supervisor for --goal-id.
    Supervisor,
}

/// Supervisor phase restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Phase {
    Plan,
    Execute,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Execute => "execute",
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "foreman",
    about = "A multi-process LLM agent runtime",
    version,
    long_about = None,
)]
pub struct Cli {
    /// Prompt for interactive / single-shot modes
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Run mode
    #[arg(long, value_enum, default_value = "interactive")]
    pub mode: Mode,

    /// Model to use, e.g. "gpt-4o" (overrides config)
    #[arg(long, short = 'M', env = "FOREMAN_MODEL")]
    pub model: Option<String>,

    /// Emit one JSON object per event on stdout instead of text
    #[arg(long)]
    pub json: bool,

    /// Disable streaming responses (one request, one body)
    #[arg(long)]
    pub no_stream: bool,

    /// Skip the approval gate entirely
    #[arg(long)]
    pub yolo: bool,

    /// Suppress the supervisor's synthetic re-prompt on pure timer ticks
    #[arg(long)]
    pub no_auto_messages: bool,

    /// Pre-approve a tool, optionally restricted by an argument pattern.
    /// May be repeated: --allow shell_execute:'git *' --allow read_file
    #[arg(long = "allow", value_name = "TOOL[:PATTERN]")]
    pub allow: Vec<String>,

    /// Pre-approve a whole tool category (e.g. read-only). May be repeated.
    #[arg(long = "allow-category", value_name = "NAME")]
    pub allow_category: Vec<String>,

    /// Root directory for config and stores (overrides FOREMAN_HOME)
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Path to config file (merged on top of auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Goal to supervise (supervisor mode)
    #[arg(long, value_name = "UUID")]
    pub goal_id: Option<String>,

    /// Create a fresh goal with this title and supervise it
    #[arg(long, value_name = "TEXT", conflicts_with = "goal_id")]
    pub goal: Option<String>,

    /// Restrict the supervisor to one phase
    #[arg(long, value_enum)]
    pub phase: Option<Phase>,

    /// Work queue to service (worker mode)
    #[arg(long, value_name = "NAME")]
    pub queue: Option<String>,

    /// Task description (background / single-shot modes)
    #[arg(long, value_name = "TEXT")]
    pub task: Option<String>,

    /// Extra context appended to the task (background mode)
    #[arg(long, value_name = "TEXT")]
    pub context: Option<String>,

    /// Shorthand for -v (debug logging)
    #[arg(long)]
    pub debug: bool,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Effective verbosity: --debug counts as one -v.
    pub fn verbosity(&self) -> u8 {
        self.verbose.max(if self.debug { 1 } else { 0 })
    }

    /// The prompt text for single-shot / background runs: positional
    /// PROMPT, falling back to --task (+ --context).
    pub fn effective_prompt(&self) -> Option<String> {
        let base = self.prompt.clone().or_else(|| self.task.clone())?;
        match &self.context {
            Some(ctx) => Some(format!("{base}\n\nContext:\n{ctx}")),
            None => Some(base),
        }
    }
}
