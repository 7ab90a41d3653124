#![forbid(unsafe_code)]

//! `file-courier` — background file-operation courier binary.
//!
//! Default mode is the interactive foreground: it reads `copy`, `move`,
//! `stop`, and `quit` commands from stdin, delegates the file operations
//! to the background worker through the engine, and prints worker
//! notifications as they arrive.
//!
//! The hidden `worker` subcommand is the entry point the engine spawns;
//! it runs the non-interactive worker loop over stdio.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use file_courier::engine::{Engine, EngineEvent};
use file_courier::wire::frame::{OverwritePolicy, Task};
use file_courier::{worker, AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "file-courier", about = "Background file-operation courier", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Debug mode: mirror worker output, echo tasks, disable idle auto-stop.
    #[arg(long)]
    debug: bool,

    /// Override the idle-shutdown timeout in seconds.
    #[arg(long)]
    idle_timeout: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background worker loop (spawned internally by the engine).
    #[command(hide = true)]
    Worker,
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
    if matches!(args.command, Some(Command::Worker)) {
        // Stdout is the protocol channel; all logging already goes to stderr.
        return worker::run().await;
    }

    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if args.debug {
        config.debug = true;
    }
    if let Some(seconds) = args.idle_timeout {
        if seconds == 0 {
            return Err(AppError::Config(
                "idle timeout must be greater than zero".into(),
            ));
        }
        config.idle_timeout_seconds = seconds;
    }

    info!(
        idle_timeout_seconds = config.idle_timeout_seconds,
        debug = config.debug,
        "file-courier foreground starting"
    );

    // ── Engine + event loop ─────────────────────────────
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let engine = Arc::new(Engine::new(config, event_tx));

    println!("file-courier ready — commands: copy <src>... <dest> | move <src>... <dest> | stop | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }

            line = lines.next_line() => {
                match line? {
                    None => break,
                    Some(text) => {
                        if !handle_command(&engine, text.trim()).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    engine.stop().await;
    info!("file-courier foreground shut down");
    Ok(())
}

/// Handle one interactive command line; returns `false` to quit.
async fn handle_command(engine: &Arc<Engine>, input: &str) -> bool {
    let mut parts = input.split_whitespace();
    match parts.next() {
        None => true,

        Some(verb @ ("copy" | "move")) => {
            let paths: Vec<PathBuf> = parts.map(PathBuf::from).collect();
            let Some((dest, sources)) = paths.split_last() else {
                println!("usage: {verb} <source>... <dest>");
                return true;
            };
            if sources.is_empty() {
                println!("usage: {verb} <source>... <dest>");
                return true;
            }

            let task = if verb == "copy" {
                Task::Copy {
                    sources: sources.to_vec(),
                    dest: dest.clone(),
                    overwrite: OverwritePolicy::Always,
                }
            } else {
                Task::Move {
                    sources: sources.to_vec(),
                    dest: dest.clone(),
                    overwrite: OverwritePolicy::Always,
                }
            };

            if let Err(err) = engine.submit(task).await {
                println!("[error] {err}");
            }
            true
        }

        Some("stop") => {
            engine.stop().await;
            println!("background work aborted");
            true
        }

        Some("quit" | "exit") => false,

        Some("help") => {
            println!("commands: copy <src>... <dest> | move <src>... <dest> | stop | quit");
            true
        }

        Some(other) => {
            println!("unknown command: {other} (try `help`)");
            true
        }
    }
}

/// Print one engine event to the user's message log.
fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Notification(text) => println!("[worker] {text}"),
        EngineEvent::Diagnostic(text) => println!("[debug] {text}"),
        EngineEvent::Error(text) => println!("[error] {text}"),
        EngineEvent::WorkerExited { reason } => println!("[worker exited: {reason}]"),
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stdout carries either the wire protocol (worker) or the interactive
    // message log (foreground); logs always go to stderr.
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

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
