//! Configuration management for warden.
//!
//! This module defines the structure of the `warden.toml` (or `warden.json`)
//! configuration file, loads it, and validates each `[[apps]]` record into an
//! immutable `AppEntry`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::EnvTemplate;
use crate::error::ConfigError;
use crate::events::ProcessSignal;
use crate::process::{AppEntry, Interpreter, ShutdownSettings, WatchSpec};

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Apps to supervise.
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Configuration for a single app, as written in the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Unique app name.
    pub name: Option<String>,
    /// Executable to launch.
    pub script: Option<String>,
    /// Arguments, either one shell-style string or a list.
    pub args: Option<ArgsConfig>,
    /// `"none"` to run `script` directly, otherwise the interpreter program.
    pub interpreter: Option<String>,
    /// Working directory for the process.
    pub cwd: Option<String>,
    /// Environment variables, values may use `${VAR:-default}`.
    pub env: Option<BTreeMap<String, String>>,
    /// `false`, `true` (watch `cwd`), or a list of paths.
    pub watch: Option<WatchConfig>,
    /// Glob patterns excluded from watching.
    pub ignore_watch: Option<Vec<String>>,
    /// Whether `.gitignore` rules also exclude watched paths (default: true).
    pub watch_gitignore: Option<bool>,
    /// Debounce interval in milliseconds for watch events.
    pub watch_delay: Option<u64>,
    /// Restart the process whenever it exits (default: true).
    pub autorestart: Option<bool>,
    /// Resident memory ceiling, e.g. `"8G"`.
    pub max_memory_restart: Option<MemoryLimit>,
    /// Fixed delay in milliseconds before restarting.
    pub restart_delay: Option<u64>,
    /// Initial delay in milliseconds of the exponential backoff.
    pub exp_backoff_restart_delay: Option<u64>,
    /// Consecutive unstable restarts before giving up.
    pub max_restarts: Option<u32>,
    /// Milliseconds a run must last to count as stable.
    pub min_uptime: Option<u64>,
    /// First signal sent on stop (default: SIGINT).
    pub kill_signal: Option<String>,
    /// Milliseconds to wait after `kill_signal` before SIGKILL.
    pub kill_timeout: Option<u64>,
    /// Template for a log file path.
    pub log_file: Option<String>,
    /// Color override for the app name in output.
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgsConfig {
    Line(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WatchConfig {
    Enabled(bool),
    Paths(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Bytes(u64),
    Size(String),
}

/// Supported config file encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Picks the format from the file extension, defaulting to TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

impl Config {
    /// Parses config text in the given format. `origin` names the source in errors.
    pub fn parse(raw: &str, format: ConfigFormat, origin: &str) -> Result<Self, ConfigError> {
        let parsed = match format {
            ConfigFormat::Toml => toml::from_str(raw).map_err(|err| err.to_string()),
            ConfigFormat::Json => serde_json::from_str(raw).map_err(|err| err.to_string()),
        };
        parsed.map_err(|message| ConfigError::Parse {
            origin: origin.to_string(),
            message,
        })
    }

    /// Validates every app record, in file order.
    pub fn entries(&self) -> Result<Vec<AppEntry>, ConfigError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(self.apps.len());
        for (index, app) in self.apps.iter().enumerate() {
            let entry = entry_from_config(index, app)?;
            if !seen.insert(entry.name.clone()) {
                return Err(ConfigError::DuplicateName(entry.name));
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Config::parse(&raw, ConfigFormat::from_path(path), &path.display().to_string())
}

/// Loads a config file and validates it into entries. Fails on an empty file.
pub fn load_entries(path: &Path) -> Result<Vec<AppEntry>, ConfigError> {
    let entries = load_config(path)?.entries()?;
    if entries.is_empty() {
        return Err(ConfigError::Empty(path.display().to_string()));
    }
    Ok(entries)
}

/// `warden.toml`, then `warden.json`, in the current directory.
pub fn default_config_path() -> Option<PathBuf> {
    ["warden.toml", "warden.json"]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn required(value: Option<&String>, index: usize, field: &'static str) -> Result<String, ConfigError> {
    match value.map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::MissingField { index, field }),
    }
}

fn entry_from_config(index: usize, config: &AppConfig) -> Result<AppEntry, ConfigError> {
    let name = required(config.name.as_ref(), index, "name")?;
    let script = required(config.script.as_ref(), index, "script")?;
    let invalid = |field: &'static str, message: String| ConfigError::InvalidField {
        name: name.clone(),
        field,
        message,
    };

    let mut entry = AppEntry::new(name.clone(), script);

    entry.args = match &config.args {
        Some(ArgsConfig::Line(line)) => {
            shell_words::split(line).map_err(|err| invalid("args", err.to_string()))?
        }
        Some(ArgsConfig::List(list)) => list.clone(),
        None => Vec::new(),
    };

    entry.interpreter = match config.interpreter.as_deref().map(str::trim) {
        None | Some("none") => Interpreter::Direct,
        Some("") => return Err(invalid("interpreter", "must not be empty".to_string())),
        Some(program) => Interpreter::Program(program.to_string()),
    };

    entry.cwd = config.cwd.as_ref().map(PathBuf::from);

    for (key, value) in config.env.iter().flatten() {
        if key.is_empty() || key.contains('=') {
            return Err(invalid("env", format!("invalid variable name `{}`", key)));
        }
        let template = EnvTemplate::parse(value)
            .map_err(|message| invalid("env", format!("{}: {}", key, message)))?;
        entry.env.insert(key.clone(), template);
    }

    // Relative watch paths follow the app's working directory.
    let root = entry.cwd.clone().unwrap_or_else(|| PathBuf::from("."));
    let paths = match &config.watch {
        None | Some(WatchConfig::Enabled(false)) => Vec::new(),
        Some(WatchConfig::Enabled(true)) => vec![root],
        Some(WatchConfig::Paths(paths)) => paths.iter().map(|path| root.join(path)).collect(),
    };
    let defaults = WatchSpec::default();
    entry.watch = WatchSpec {
        paths,
        ignore: config.ignore_watch.clone().unwrap_or_default(),
        gitignore: config.watch_gitignore.unwrap_or(defaults.gitignore),
        debounce_ms: config.watch_delay.unwrap_or(defaults.debounce_ms),
    };

    entry.max_memory_bytes = match &config.max_memory_restart {
        None => None,
        Some(MemoryLimit::Bytes(0)) => {
            return Err(invalid("max_memory_restart", "must be greater than zero".to_string()))
        }
        Some(MemoryLimit::Bytes(bytes)) => Some(*bytes),
        Some(MemoryLimit::Size(text)) => {
            Some(parse_memory_size(text).map_err(|message| invalid("max_memory_restart", message))?)
        }
    };

    let restart = &mut entry.restart;
    restart.autorestart = config.autorestart.unwrap_or(restart.autorestart);
    restart.fixed_delay = config.restart_delay.map(Duration::from_millis);
    if let Some(ms) = config.exp_backoff_restart_delay {
        restart.backoff_base = Duration::from_millis(ms);
    }
    restart.max_restarts = config.max_restarts.unwrap_or(restart.max_restarts);
    if let Some(ms) = config.min_uptime {
        restart.min_uptime = Duration::from_millis(ms);
    }

    let defaults = ShutdownSettings::default();
    let signal = match config.kill_signal.as_deref() {
        None => defaults.signal,
        Some(value) => ProcessSignal::parse(value)
            .ok_or_else(|| invalid("kill_signal", format!("unknown signal `{}`", value)))?,
    };
    entry.shutdown = ShutdownSettings {
        signal,
        timeout: config
            .kill_timeout
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout),
    };

    entry.log_file = config.log_file.clone();
    entry.color = config.color.clone();
    Ok(entry)
}

/// Parses sizes such as `"8G"`, `"512MB"`, `"300k"` or `"1048576"`.
///
/// Units are binary multiples; a trailing `B` is optional and case is ignored.
pub fn parse_memory_size(value: &str) -> Result<u64, String> {
    let text = value.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    if number.is_empty() {
        return Err(format!("`{}` does not start with a number", value));
    }
    let amount: u64 = number
        .parse()
        .map_err(|_| format!("`{}` is out of range", value))?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        "t" | "tb" => 1 << 40,
        other => return Err(format!("unknown size unit `{}`", other)),
    };
    let bytes = amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("`{}` is out of range", value))?;
    if bytes == 0 {
        return Err("must be greater than zero".to_string());
    }
    Ok(bytes)
}
