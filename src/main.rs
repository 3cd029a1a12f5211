//! Warden: a small supervisor for long-running processes.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the app configuration, starts one supervisor per app, and
//! runs the event loop that reports what those supervisors do.

mod config;
mod env;
mod error;
mod events;
mod monitor;
mod output;
mod process;
mod restart;
mod runner;
mod supervisor;
mod watch;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::events::{Event, ProcessSignal};
use crate::monitor::SystemProbe;
use crate::output::OutputSink;
use crate::process::{AppEntry, StopReason};
use crate::supervisor::{Supervisor, SupervisorHandle};

const DEFAULT_MEMORY_INTERVAL_MS: u64 = 1000;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "warden",
    version,
    about = "Keeps long-running processes alive",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the config file (default: warden.toml or warden.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start and supervise the configured apps (default).
    Start(StartArgs),
    /// Validate the config and print each app's command and environment.
    Check,
}

#[derive(Debug, Args)]
struct StartArgs {
    /// Only start the named apps.
    #[arg(long = "only", value_name = "NAME")]
    only: Vec<String>,
    /// Interval between resident memory samples (ms).
    #[arg(long, default_value_t = DEFAULT_MEMORY_INTERVAL_MS)]
    memory_interval_ms: u64,
    /// Print process output without `[name]` prefixes.
    #[arg(long)]
    raw: bool,
}

impl Default for StartArgs {
    fn default() -> Self {
        Self {
            only: Vec::new(),
            memory_interval_ms: DEFAULT_MEMORY_INTERVAL_MS,
            raw: false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => path,
        None => bail!("no config file found (use warden.toml, warden.json or --config)"),
    };
    let entries = config::load_entries(&config_path)
        .with_context(|| format!("invalid config {}", config_path.display()))?;
    let inherited: HashMap<String, String> = std::env::vars().collect();

    match cli.command {
        Some(Commands::Check) => {
            print_check(&entries, &inherited);
            Ok(())
        }
        Some(Commands::Start(args)) => run(entries, &inherited, args).await,
        None => run(entries, &inherited, StartArgs::default()).await,
    }
}

fn print_check(entries: &[AppEntry], inherited: &HashMap<String, String>) {
    for entry in entries {
        println!("{}", entry.name);
        println!("  command: {}", runner::format_command(entry));
        if let Some(cwd) = &entry.cwd {
            println!("  cwd: {}", cwd.display());
        }
        println!("  autorestart: {}", entry.restart.autorestart);
        match entry.max_memory_bytes {
            Some(bytes) => println!("  max memory: {} bytes", bytes),
            None => println!("  max memory: unlimited"),
        }
        if entry.watch.is_enabled() {
            let paths: Vec<String> = entry
                .watch
                .paths
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            println!("  watch: {}", paths.join(", "));
        } else {
            println!("  watch: off");
        }
        let resolved = env::resolve_env(entry, inherited);
        for (key, template) in &entry.env {
            let value = resolved.get(key).map(String::as_str).unwrap_or("");
            if value == template.as_str() {
                println!("  env {}={}", key, value);
            } else {
                println!("  env {}={}  ({})", key, value, template.as_str());
            }
        }
    }
}

async fn run(
    entries: Vec<AppEntry>,
    inherited: &HashMap<String, String>,
    args: StartArgs,
) -> Result<()> {
    let entries = select_entries(entries, &args.only)?;
    let memory_interval = Duration::from_millis(args.memory_interval_ms.max(10));

    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut output = OutputSink::new(&entries, args.raw);
    let mut handles = Vec::with_capacity(entries.len());
    for (id, entry) in entries.iter().enumerate() {
        let env = env::resolve_env(entry, inherited);
        let (supervisor, controls) = Supervisor::new(
            id,
            entry.clone(),
            env,
            SystemProbe::new(),
            memory_interval,
            event_tx.clone(),
        );
        let handle = SupervisorHandle::spawn(supervisor, controls);
        if watch::spawn_watcher(entry, handle.restarts()).is_some() {
            info!(app = %entry.name, paths = ?entry.watch.paths, "watching for changes");
        }
        handles.push(handle);
    }
    spawn_signal_listener(event_tx.clone());
    drop(event_tx);

    let mut remaining = handles.len();
    let mut failures = Vec::new();
    let mut phase = ShutdownPhase::Running;
    while remaining > 0 {
        let Some(event) = event_rx.recv().await else {
            break;
        };
        match event {
            Event::Shutdown { signal } => {
                phase = phase.escalate();
                match phase {
                    ShutdownPhase::Graceful => {
                        info!(signal = signal.label(), "shutting down (signal again to force)");
                        for handle in &handles {
                            handle.shutdown();
                        }
                    }
                    ShutdownPhase::Forced => {
                        warn!(signal = signal.label(), "forcing shutdown");
                        for handle in &handles {
                            handle.abort();
                        }
                        break;
                    }
                    ShutdownPhase::Running => {}
                }
            }
            Event::Stopped { id, reason } => {
                remaining -= 1;
                report_stop(id, reason, &mut output);
                if reason.is_failure() {
                    failures.push(format!("{}: {}", output.name(id), reason));
                }
            }
            other => report_event(other, &mut output),
        }
    }

    for handle in handles {
        handle.join().await;
    }
    if phase == ShutdownPhase::Forced {
        bail!("forced shutdown");
    }
    if !failures.is_empty() && phase == ShutdownPhase::Running {
        bail!("apps stopped: {}", failures.join("; "));
    }
    Ok(())
}

/// How far an operator-requested shutdown has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    Running,
    /// Supervisors are stopping their processes with the configured signal.
    Graceful,
    /// A second signal arrived. Supervision is abandoned.
    Forced,
}

impl ShutdownPhase {
    fn escalate(self) -> Self {
        match self {
            ShutdownPhase::Running => ShutdownPhase::Graceful,
            ShutdownPhase::Graceful | ShutdownPhase::Forced => ShutdownPhase::Forced,
        }
    }
}

fn select_entries(entries: Vec<AppEntry>, only: &[String]) -> Result<Vec<AppEntry>> {
    if only.is_empty() {
        return Ok(entries);
    }
    for name in only {
        if !entries.iter().any(|entry| &entry.name == name) {
            bail!("unknown app {}", name);
        }
    }
    Ok(entries
        .into_iter()
        .filter(|entry| only.contains(&entry.name))
        .collect())
}

fn report_event(event: Event, output: &mut OutputSink) {
    match event {
        Event::ProcessStarting { id } => {
            info!(app = %output.name(id), "starting");
            output.note(id, "starting");
        }
        Event::ProcessStarted { id, pid } => {
            info!(app = %output.name(id), pid, "started");
            output.note(id, &format!("started (pid {})", pid));
        }
        Event::ProcessOutput { id, line, stream } => output.line(id, stream, &line),
        Event::ProcessExited { id, code, uptime } => {
            let message = match code {
                Some(code) => format!("exited with code {}", code),
                None => "exited".to_string(),
            };
            if code == Some(0) {
                info!(app = %output.name(id), uptime_ms = uptime.as_millis() as u64, "{}", message);
            } else {
                warn!(app = %output.name(id), uptime_ms = uptime.as_millis() as u64, "{}", message);
            }
            output.note(id, &message);
        }
        Event::MemoryExceeded { id, rss, limit } => {
            warn!(app = %output.name(id), rss, limit, "memory limit exceeded, killing");
            output.note(id, &format!("memory {} > {} bytes, killing", rss, limit));
        }
        Event::SpawnFailed { id, error } => {
            output.note(id, &format!("spawn failed: {}", error));
        }
        Event::ProcessSignal { id, signal } => {
            tracing::debug!(app = %output.name(id), signal = signal.label(), "signal sent");
            output.note(id, &format!("sent {}", signal.label()));
        }
        Event::Restarting { id, delay, attempt } => {
            info!(app = %output.name(id), attempt, delay_ms = delay.as_millis() as u64, "restarting");
            output.note(id, &format!("restarting in {}ms (attempt {})", delay.as_millis(), attempt));
        }
        Event::Waiting { id, reason } => {
            if reason.is_failure() {
                warn!(app = %output.name(id), "stopped: {}; waiting for changes", reason);
            } else {
                info!(app = %output.name(id), "stopped: {}; waiting for changes", reason);
            }
            output.note(id, &format!("stopped: {}; waiting for changes", reason));
        }
        Event::Stopped { id, reason } => report_stop(id, reason, output),
        Event::Shutdown { .. } => {}
    }
}

fn report_stop(id: usize, reason: StopReason, output: &mut OutputSink) {
    if reason.is_failure() {
        error!(app = %output.name(id), "stopped: {}", reason);
    } else {
        info!(app = %output.name(id), "stopped: {}", reason);
    }
    output.note(id, &format!("stopped: {}", reason));
}

// Forwards every SIGINT/SIGTERM until the event loop goes away.
fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                    (Err(err), _) | (_, Err(err)) => {
                        warn!(error = %err, "cannot listen for signals");
                        return;
                    }
                };
            loop {
                let signal = tokio::select! {
                    Some(()) = sigint.recv() => ProcessSignal::SigInt,
                    Some(()) = sigterm.recv() => ProcessSignal::SigTerm,
                    else => return,
                };
                if tx.send(Event::Shutdown { signal }).await.is_err() {
                    return;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                let shutdown = Event::Shutdown {
                    signal: ProcessSignal::SigInt,
                };
                if tx.send(shutdown).await.is_err() {
                    return;
                }
            }
        }
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_start_options() {
        let cli = Cli::parse_from([
            "warden",
            "start",
            "--only",
            "three-gen-generation",
            "--memory-interval-ms",
            "250",
            "--config",
            "gen.toml",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("gen.toml")));
        match cli.command {
            Some(Commands::Start(args)) => {
                assert_eq!(args.only, vec!["three-gen-generation"]);
                assert_eq!(args.memory_interval_ms, 250);
                assert!(!args.raw);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn select_entries_filters_and_rejects_unknown() {
        let entries = vec![AppEntry::new("a", "x"), AppEntry::new("b", "y")];
        let picked = select_entries(entries.clone(), &["b".to_string()]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "b");
        assert_eq!(select_entries(entries.clone(), &[]).unwrap().len(), 2);
        assert!(select_entries(entries, &["c".to_string()]).is_err());
    }

    #[test]
    fn second_shutdown_signal_forces() {
        let phase = ShutdownPhase::Running.escalate();
        assert_eq!(phase, ShutdownPhase::Graceful);
        assert_eq!(phase.escalate(), ShutdownPhase::Forced);
        assert_eq!(phase.escalate().escalate(), ShutdownPhase::Forced);
    }
}
