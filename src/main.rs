// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod output;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Mode};
use foreman_config::Config;
use foreman_core::{
    ApprovalDecision, ApprovalGate, ApprovalPrompt, AutoDenyPrompt, Dispatcher, ProcessOptions,
    ProxyApprovalPrompt, Services, Session, SubAgentManager, SubAgentSpawnTool,
    SubAgentStatusTool, SubAgentWaitTool, Transcript, TurnExecutor, TurnOutcome,
    ENV_APPROVAL_REPLY_FD, ENV_APPROVAL_REQUEST_FD, ENV_IS_SUBAGENT,
};
use foreman_goap::{run_worker, Supervisor, WorkerOptions};
use foreman_model::ModelProvider;
use foreman_store::Store;
use foreman_tools::{
    interrupt::{clear_interrupt, raise_interrupt},
    ListDirTool, ProtectedPaths, ReadFileTool, ShellTool, ToolRegistry, WriteFileTool,
};
use output::EventPrinter;

const SYSTEM_PROMPT: &str = "\
You are foreman, a capable engineering agent running in a terminal. Use \
the available tools to inspect and change the system; delegate focused \
background work to sub-agents with subagent_spawn when it helps. Be \
concise; prefer doing over describing.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbosity());

    let mut config = foreman_config::load(cli.config.as_deref(), cli.home.as_deref())?;
    apply_cli_overrides(&mut config, &cli);

    // Ctrl-C raises the process-wide interrupt flag; the running turn and
    // any in-flight tool observe it at the next safe point.
    tokio::spawn(async {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            eprintln!("interrupted");
            raise_interrupt();
        }
    });

    let code = match cli.mode {
        Mode::Interactive => run_interactive(&cli, &config).await?,
        Mode::SingleShot => run_single_shot(&cli, &config).await?,
        Mode::Background => run_background(&cli, &config).await?,
        Mode::Worker => run_worker_mode(&cli, &config).await?,
        Mode::Supervisor => run_supervisor(&cli, &config).await?,
    };
    std::process::exit(code);
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("FOREMAN_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("foreman={default},foreman_core={default},foreman_goap={default},foreman_tools={default},foreman_store={default},foreman_model={default}")));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }
    if cli.no_stream {
        config.model.stream = false;
    }
    if cli.yolo {
        config.tools.yolo = true;
    }
    if cli.no_auto_messages {
        config.supervisor.no_auto_messages = true;
    }
    config.tools.allow.extend(cli.allow.iter().cloned());
    config
        .tools
        .allow_categories
        .extend(cli.allow_category.iter().cloned());
}

// ── Session assembly ──────────────────────────────────────────────────────────

struct BuiltSession {
    session: Session,
    subagents: Option<Arc<SubAgentManager>>,
}

fn build_session(
    config: &Config,
    home: Option<&Path>,
    store: Option<Arc<Store>>,
    prompt: Arc<dyn ApprovalPrompt>,
    with_subagents: bool,
) -> anyhow::Result<BuiltSession> {
    let model: Arc<dyn ModelProvider> = Arc::from(foreman_model::from_config(&config.model)?);
    let gate = Arc::new(ApprovalGate::new(&config.tools, prompt));
    let protected = Arc::new(ProtectedPaths::new(&config.tools.protected_paths));

    let mut registry = ToolRegistry::new();
    registry.register(ShellTool {
        timeout_secs: config.tools.shell_timeout_secs,
        timeout_cap_secs: config.tools.shell_timeout_cap_secs,
    });
    registry.register(ReadFileTool);
    registry.register(ListDirTool);
    registry.register(WriteFileTool { protected });

    let services = Arc::new(Services::new(store));
    let subagents = if with_subagents {
        let mgr = Arc::new(SubAgentManager::new(
            &config.subagents,
            gate.clone(),
            services.clone(),
        ));
        registry.register(SubAgentSpawnTool { mgr: mgr.clone() });
        registry.register(SubAgentStatusTool { mgr: mgr.clone() });
        registry.register(SubAgentWaitTool { mgr: mgr.clone() });
        Some(mgr)
    } else {
        None
    };

    let mut session = Session::new(
        model,
        Dispatcher::new(Arc::new(registry), gate),
        Arc::new(config.agent.clone()),
        services,
    )
    .with_streaming(config.model.stream)
    .with_system_prompt(SYSTEM_PROMPT);

    match Transcript::create(&foreman_config::logs_dir(home), &session.id) {
        Ok(t) => session = session.with_transcript(t),
        Err(e) => warn!(error = %e, "conversation log disabled"),
    }

    Ok(BuiltSession { session, subagents })
}

fn open_store(cli: &Cli) -> anyhow::Result<Arc<Store>> {
    let path = foreman_config::store_path(cli.home.as_deref());
    Ok(Arc::new(Store::open(&path)?))
}

// ── Interactive mode ──────────────────────────────────────────────────────────

async fn run_interactive(cli: &Cli, config: &Config) -> anyhow::Result<i32> {
    let store = open_store(cli).ok();
    let prompt: Arc<dyn ApprovalPrompt> = Arc::new(StdinApprovalPrompt);
    let built = build_session(config, cli.home.as_deref(), store, prompt, true)?;
    let subagents = built.subagents.clone();
    let mut executor = TurnExecutor::new(built.session)?;

    eprintln!(
        "foreman — model {}, type a message (ctrl-d or 'exit' to quit)",
        config.model.name
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // Run an initial prompt passed on the command line, then drop to the loop.
    let mut queued = cli.effective_prompt();

    loop {
        let line = match queued.take() {
            Some(l) => l,
            None => {
                use std::io::Write;
                eprint!("> ");
                let _ = std::io::stderr().flush();
                match lines.next_line().await? {
                    Some(l) => l,
                    None => break,
                }
            }
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        clear_interrupt();
        let (tx, rx) = mpsc::channel(256);
        let printer = EventPrinter::spawn(rx, cli.json, config.model.stream);
        executor.start(line, tx).await?;

        // Event loop for this turn: wake on the executor's pipe, service
        // sub-agent approval requests on every pass.
        loop {
            let ev = executor.next_event(Duration::from_millis(100)).await;
            if let Some(mgr) = &subagents {
                mgr.poll_approvals().await;
            }
            match ev {
                Some(foreman_core::AsyncEvent::Complete)
                | Some(foreman_core::AsyncEvent::Error)
                | Some(foreman_core::AsyncEvent::Interrupted) => break,
                Some(_) => {}
                None => {
                    if !executor.is_running() {
                        // Terminal byte raced the poll; drain and move on.
                        executor.process_events();
                        break;
                    }
                }
            }
        }
        printer.finish().await;

        match executor.result() {
            TurnOutcome::Ok => {}
            TurnOutcome::Cancelled => eprintln!("interrupted"),
            other => {
                let detail = executor.error().unwrap_or_default();
                eprintln!("turn failed ({}): {detail}", other.code());
            }
        }
    }

    executor.shutdown().await;
    if let Some(mgr) = subagents {
        mgr.shutdown_all().await;
    }
    Ok(0)
}

// ── Single-shot and background modes ──────────────────────────────────────────

async fn run_single_shot(cli: &Cli, config: &Config) -> anyhow::Result<i32> {
    let text = cli
        .effective_prompt()
        .context("single-shot mode needs a PROMPT or --task")?;
    let store = open_store(cli).ok();
    let prompt: Arc<dyn ApprovalPrompt> = if stderr_is_tty() {
        Arc::new(StdinApprovalPrompt)
    } else {
        Arc::new(AutoDenyPrompt)
    };
    let built = build_session(config, cli.home.as_deref(), store, prompt, true)?;
    let code = run_one_turn(built, &text, cli.json, config.model.stream).await;
    Ok(code)
}

async fn run_background(cli: &Cli, config: &Config) -> anyhow::Result<i32> {
    let text = cli
        .effective_prompt()
        .context("background mode needs --task")?;

    // A sub-agent proxies approvals to its parent through the pipe fds in
    // the environment; without them it auto-denies.
    let prompt: Arc<dyn ApprovalPrompt> = match (
        std::env::var(ENV_APPROVAL_REQUEST_FD),
        std::env::var(ENV_APPROVAL_REPLY_FD),
    ) {
        (Ok(req), Ok(reply)) => {
            let req: i32 = req.parse().context("bad APPROVAL_REQUEST_FD")?;
            let reply: i32 = reply.parse().context("bad APPROVAL_REPLY_FD")?;
            let id = std::env::var("FOREMAN_SUBAGENT_ID").unwrap_or_else(|_| "unknown".into());
            Arc::new(ProxyApprovalPrompt::from_fds(id, req, reply))
        }
        _ => Arc::new(AutoDenyPrompt),
    };

    // Sub-agents never get the spawn tools; nesting is also refused by
    // the manager via IS_SUBAGENT, this just keeps the schema honest.
    let nested = std::env::var_os(ENV_IS_SUBAGENT).is_some();
    let built = build_session(config, cli.home.as_deref(), None, prompt, !nested)?;
    let code = run_one_turn(built, &text, cli.json, config.model.stream).await;
    Ok(code)
}

async fn run_one_turn(mut built: BuiltSession, text: &str, json: bool, stream: bool) -> i32 {
    let (tx, rx) = mpsc::channel(256);
    let printer = EventPrinter::spawn(rx, json, stream);
    let cancel = AtomicBool::new(false);
    let outcome = built
        .session
        .process(text, ProcessOptions::default(), tx, &cancel)
        .await;
    printer.finish().await;
    if let Some(mgr) = built.subagents {
        mgr.shutdown_all().await;
    }
    output::print_result(json, outcome);
    outcome.code()
}

// ── Worker mode ───────────────────────────────────────────────────────────────

async fn run_worker_mode(cli: &Cli, config: &Config) -> anyhow::Result<i32> {
    let queue = cli.queue.clone().context("worker mode needs --queue")?;
    let store = open_store(cli)?;
    let built = build_session(
        config,
        cli.home.as_deref(),
        Some(store.clone()),
        Arc::new(AutoDenyPrompt),
        false,
    )?;
    let opts = WorkerOptions::from_env(
        queue,
        Duration::from_secs(config.supervisor.worker_idle_timeout_secs),
    );
    info!(queue = %opts.queue, "starting worker mode");
    run_worker(built.session, store, opts).await
}

// ── Supervisor mode ───────────────────────────────────────────────────────────

async fn run_supervisor(cli: &Cli, config: &Config) -> anyhow::Result<i32> {
    let store = open_store(cli)?;
    let goal_id = match (&cli.goal_id, &cli.goal) {
        (Some(id), _) => id.clone(),
        (None, Some(title)) => {
            let id = store.create_goal(title)?;
            info!(goal = %id, "created goal");
            id
        }
        (None, None) => anyhow::bail!("supervisor mode needs --goal-id or --goal"),
    };

    let model: Arc<dyn ModelProvider> = Arc::from(foreman_model::from_config(&config.model)?);
    let supervisor = Supervisor::new(model, store, goal_id, config, cli.home.clone())?
        .with_phase(cli.phase.map(|p| p.as_str()));
    Ok(supervisor.run().await)
}

// ── Interactive approval prompt ───────────────────────────────────────────────

/// Asks on stderr, reads one line from stdin.  Only used while no REPL
/// read is pending (the REPL blocks on the event pipe during a turn).
struct StdinApprovalPrompt;

#[async_trait::async_trait]
impl ApprovalPrompt for StdinApprovalPrompt {
    async fn request(&self, tool: &str, summary: &str) -> anyhow::Result<ApprovalDecision> {
        let tool = tool.to_string();
        let summary = summary.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<ApprovalDecision> {
            use std::io::{BufRead, Write};
            eprint!("approve {tool} ({summary})? [y]es / [n]o / [s]ession: ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(match line.trim().to_lowercase().as_str() {
                "y" | "yes" => ApprovalDecision::Allow,
                "s" | "session" => ApprovalDecision::AllowSession,
                _ => ApprovalDecision::Deny,
            })
        })
        .await?
    }
}

fn stderr_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDERR_FILENO) != 0 }
}
