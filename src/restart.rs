//! Restart decisions.
//!
//! `RestartTracker` turns the way a run ended into either a delayed restart or
//! a final stop. It holds no process state, so every rule here is testable
//! without spawning anything.

use std::time::Duration;

use crate::process::StopReason;

const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Per-app restart settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Relaunch after the process exits or is killed for memory.
    pub autorestart: bool,
    /// Fixed delay before every restart. Overrides the backoff.
    pub fixed_delay: Option<Duration>,
    /// First delay of the exponential backoff.
    pub backoff_base: Duration,
    /// Consecutive unstable runs tolerated before giving up.
    pub max_restarts: u32,
    /// Runs shorter than this are unstable.
    pub min_uptime: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            autorestart: true,
            fixed_delay: None,
            backoff_base: Duration::from_millis(100),
            max_restarts: 16,
            min_uptime: Duration::from_millis(1000),
        }
    }
}

/// How a single run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited by itself.
    Exited { code: Option<i32> },
    /// The process was killed for exceeding its memory ceiling.
    MemoryExceeded,
    /// The process could not be started.
    SpawnFailed,
    /// A restart was requested (file change).
    RestartRequested,
}

/// What the supervisor does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Restart { delay: Duration, attempt: u32 },
    Stop(StopReason),
}

/// Tracks consecutive unstable runs for one app.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    unstable_runs: u32,
    restarts: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            unstable_runs: 0,
            restarts: 0,
        }
    }

    /// Total restarts granted so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Decides what follows a run that ended with `outcome` after `uptime`.
    pub fn decide(&mut self, outcome: RunOutcome, uptime: Duration) -> Decision {
        if outcome == RunOutcome::RestartRequested {
            self.unstable_runs = 0;
            self.restarts += 1;
            return Decision::Restart {
                delay: Duration::ZERO,
                attempt: self.restarts,
            };
        }

        if !self.policy.autorestart {
            let code = match outcome {
                RunOutcome::Exited { code } => code,
                _ => None,
            };
            return Decision::Stop(StopReason::AutorestartDisabled { code });
        }

        let unstable = outcome == RunOutcome::SpawnFailed || uptime < self.policy.min_uptime;
        if unstable {
            self.unstable_runs += 1;
            if self.unstable_runs > self.policy.max_restarts {
                return Decision::Stop(StopReason::CrashLoop {
                    unstable_runs: self.unstable_runs,
                });
            }
        } else {
            self.unstable_runs = 0;
        }

        self.restarts += 1;
        Decision::Restart {
            delay: self.delay(),
            attempt: self.restarts,
        }
    }

    fn delay(&self) -> Duration {
        if let Some(delay) = self.policy.fixed_delay {
            return delay;
        }
        let exponent = self.unstable_runs.saturating_sub(1).min(16);
        self.policy
            .backoff_base
            .saturating_mul(1_u32 << exponent)
            .min(MAX_BACKOFF)
    }
}
