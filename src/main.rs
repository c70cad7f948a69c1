#![forbid(unsafe_code)]

//! `agent-tether` — drive a stream-json agent from the terminal.
//!
//! Reads prompts from `--prompt` or stdin (one per line), runs each as a
//! query, and prints every event as a JSON line on stdout. Ctrl-C interrupts
//! the running query; the next prompt resumes the same conversation. A second
//! Ctrl-C while idle, or SIGTERM, exits.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_tether::{AppError, Engine, EngineConfig, Result, SessionSlot};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-tether", about = "Stream-json agent session driver", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run a single prompt instead of reading prompts from stdin.
    #[arg(long)]
    prompt: Option<String>,

    /// Resume this continuation id on the first spawn.
    #[arg(long)]
    resume: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => EngineConfig::load_from_path(path)?,
        None => {
            let mut config = EngineConfig::new("claude");
            config.validate()?;
            config
        }
    };
    info!(binary = %config.binary, "configuration loaded");

    let mut slot = args
        .resume
        .clone()
        .map_or_else(SessionSlot::new, SessionSlot::resuming);

    // ── Prompt loop ─────────────────────────────────────
    if let Some(prompt) = &args.prompt {
        let engine = slot.acquire(config).await?;
        run_prompt(engine, prompt).await?;
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                () = shutdown_signal() => {
                    info!("shutdown signal received");
                    break;
                }
            };
            let Some(line) = line else { break };
            let prompt = line.trim();
            if prompt.is_empty() {
                continue;
            }

            let engine = slot.acquire(config.clone()).await?;
            match run_prompt(engine, prompt).await {
                Ok(()) => {}
                Err(AppError::Interrupted) => info!("query interrupted"),
                Err(err @ AppError::Exited { .. }) => {
                    error!(%err, "agent exited, recreating");
                    engine.recreate()?;
                }
                Err(err) => error!(%err, "query failed"),
            }
        }
    }

    let continuation_id = slot.continuation_id();
    slot.shutdown().await;
    info!(%continuation_id, "agent-tether shut down");
    Ok(())
}

/// Stream one query to stdout, interrupting it on Ctrl-C.
async fn run_prompt(engine: &Engine, prompt: &str) -> Result<()> {
    let mut stream = engine.query(prompt).await?;
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupted = false;

    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else { return Ok(()) };
                let event = item?;
                println!("{}", serde_json::to_string(&event)?);
            }
            res = &mut interrupt, if !interrupted => {
                if let Err(err) = res {
                    warn!(%err, "ctrl-c handler failed");
                }
                interrupted = true;
                engine.interrupt();
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
