//! Event definitions for the supervisor event loop.
//!
//! Supervisors report every lifecycle step of their app through `Event`, and
//! the signal listener reports shutdown requests the same way. The main loop
//! is the only consumer.

use std::time::Duration;

use crate::output::StreamKind;
use crate::process::StopReason;

/// Represents an event in the supervisor's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A process is about to be spawned.
    ProcessStarting { id: usize },
    /// A process has been spawned.
    ProcessStarted { id: usize, pid: u32 },
    /// A line of output (stdout or stderr) was received from a process.
    ProcessOutput {
        id: usize,
        line: String,
        stream: StreamKind,
    },
    /// A process exited with an optional exit code (None usually implies signal termination).
    ProcessExited {
        id: usize,
        code: Option<i32>,
        uptime: Duration,
    },
    /// A process went over its memory ceiling and is being killed.
    MemoryExceeded { id: usize, rss: u64, limit: u64 },
    /// A process could not be spawned.
    SpawnFailed { id: usize, error: String },
    /// A signal was delivered to a process.
    ProcessSignal { id: usize, signal: ProcessSignal },
    /// A new process will be spawned after `delay`.
    Restarting {
        id: usize,
        delay: Duration,
        attempt: u32,
    },
    /// A watched app stopped on its own and waits for a file change.
    Waiting { id: usize, reason: StopReason },
    /// Supervision of an app has ended.
    Stopped { id: usize, reason: StopReason },
    /// The supervisor received a termination signal.
    Shutdown { signal: ProcessSignal },
}

/// Signals used to stop processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }

    /// Parses `SIGINT`, `int`, `SIGTERM`, `term`, `SIGKILL` or `kill`.
    pub fn parse(value: &str) -> Option<Self> {
        let upper = value.trim().to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "INT" => Some(ProcessSignal::SigInt),
            "TERM" => Some(ProcessSignal::SigTerm),
            "KILL" => Some(ProcessSignal::SigKill),
            _ => None,
        }
    }
}
