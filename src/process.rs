//! Data structures describing a supervised app.
//!
//! This module defines the immutable description of an app (`AppEntry`), the
//! lifecycle states a supervised app moves through (`ProcessStatus`), and the
//! reasons supervision can end (`StopReason`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::env::EnvTemplate;
use crate::events::ProcessSignal;
use crate::restart::RestartPolicy;

/// Everything needed to launch and keep alive one app.
#[derive(Debug, Clone)]
pub struct AppEntry {
    /// Unique name of the app.
    pub name: String,
    /// The executable (or script, when an interpreter is set).
    pub command: String,
    /// Arguments passed verbatim to the command.
    pub args: Vec<String>,
    /// How the command is executed.
    pub interpreter: Interpreter,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Declared environment variables.
    pub env: BTreeMap<String, EnvTemplate>,
    /// Filesystem watch settings.
    pub watch: WatchSpec,
    /// Restart behaviour after exits and memory breaches.
    pub restart: RestartPolicy,
    /// Resident memory ceiling in bytes.
    pub max_memory_bytes: Option<u64>,
    /// How the process is asked to stop.
    pub shutdown: ShutdownSettings,
    /// Template for a per-app log file.
    pub log_file: Option<String>,
    /// Color of the app's prefix in console output.
    pub color: Option<String>,
}

impl AppEntry {
    /// Creates an entry with default policies and no environment.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            interpreter: Interpreter::Direct,
            cwd: None,
            env: BTreeMap::new(),
            watch: WatchSpec::default(),
            restart: RestartPolicy::default(),
            max_memory_bytes: None,
            shutdown: ShutdownSettings::default(),
            log_file: None,
            color: None,
        }
    }
}

/// How the command is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpreter {
    /// Run the command itself (`interpreter = "none"`).
    Direct,
    /// Run `program command args...`.
    Program(String),
}

/// Paths that trigger a restart when they change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    /// Paths to watch, already resolved against `cwd`. Empty means watching
    /// is disabled.
    pub paths: Vec<PathBuf>,
    /// Glob patterns to ignore.
    pub ignore: Vec<String>,
    /// Whether `.gitignore` rules also exclude paths.
    pub gitignore: bool,
    /// Quiet period before a burst of changes triggers a restart.
    pub debounce_ms: u64,
}

impl WatchSpec {
    pub fn is_enabled(&self) -> bool {
        !self.paths.is_empty()
    }
}

impl Default for WatchSpec {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            ignore: Vec::new(),
            gitignore: true,
            debounce_ms: 200,
        }
    }
}

/// Signal sent first on graceful stop, and how long to wait before SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSettings {
    pub signal: ProcessSignal,
    pub timeout: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            signal: ProcessSignal::SigInt,
            timeout: Duration::from_millis(1600),
        }
    }
}

/// The current lifecycle status of a supervised app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// No process, and none will be started.
    Stopped,
    /// A process is being spawned.
    Starting,
    /// The process is alive and monitored.
    Running,
    /// The previous process is gone and a new one is scheduled.
    Restarting,
}

/// Why supervision of an app ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The process went away and `autorestart` is off.
    AutorestartDisabled { code: Option<i32> },
    /// Too many consecutive runs ended before `min_uptime`.
    CrashLoop { unstable_runs: u32 },
    /// The supervisor itself is shutting down.
    Shutdown,
}

impl StopReason {
    /// Whether the stop should be surfaced as a failure.
    pub fn is_failure(&self) -> bool {
        match self {
            StopReason::AutorestartDisabled { code } => code.unwrap_or(1) != 0,
            StopReason::CrashLoop { .. } => true,
            StopReason::Shutdown => false,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::AutorestartDisabled { code: Some(code) } => {
                write!(f, "exited with code {} (autorestart disabled)", code)
            }
            StopReason::AutorestartDisabled { code: None } => {
                write!(f, "exited (autorestart disabled)")
            }
            StopReason::CrashLoop { unstable_runs } => {
                write!(f, "gave up after {} unstable runs", unstable_runs)
            }
            StopReason::Shutdown => write!(f, "shut down"),
        }
    }
}
