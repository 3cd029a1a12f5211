//! Exit and memory monitoring for a running child.
//!
//! `observe` resolves when the child exits or when a resident memory sample
//! goes above the configured ceiling, whichever happens first.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Child;
use tokio::time::MissedTickBehavior;

/// Source of resident memory samples.
pub trait MemoryProbe: Send {
    /// Resident memory of `pid` in bytes, or `None` if it cannot be read.
    fn resident_bytes(&mut self, pid: u32) -> Option<u64>;
}

/// Reads resident memory from the OS through `sysinfo`.
pub struct SystemProbe {
    system: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn resident_bytes(&mut self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|process| process.memory())
    }
}

/// How an observed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The child exited on its own.
    Exited { code: Option<i32> },
    /// The child's resident memory went above `limit`. It is still running.
    MemoryExceeded { rss: u64, limit: u64 },
}

/// Waits for `child` to exit, sampling its memory every `interval` when a
/// `limit` is set.
pub async fn observe<P>(
    child: &mut Child,
    probe: &mut P,
    limit: Option<u64>,
    interval: Duration,
) -> std::io::Result<MonitorEvent>
where
    P: MemoryProbe + ?Sized,
{
    let (Some(limit), Some(pid)) = (limit, child.id()) else {
        let status = child.wait().await?;
        return Ok(MonitorEvent::Exited {
            code: status.code(),
        });
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            status = child.wait() => {
                return Ok(MonitorEvent::Exited { code: status?.code() });
            }
            _ = ticker.tick() => {
                if let Some(rss) = probe.resident_bytes(pid) {
                    if rss > limit {
                        return Ok(MonitorEvent::MemoryExceeded { rss, limit });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Option<u64>);

    impl MemoryProbe for FixedProbe {
        fn resident_bytes(&mut self, _pid: u32) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn system_probe_reads_current_process() {
        let mut probe = SystemProbe::new();
        let rss = probe.resident_bytes(std::process::id());
        assert!(rss.unwrap_or(0) > 0);
    }

    #[test]
    fn system_probe_handles_missing_process() {
        let mut probe = SystemProbe::new();
        assert!(probe.resident_bytes(u32::MAX - 1).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_exit_code() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let mut probe = FixedProbe(Some(1));
        let event = observe(&mut child, &mut probe, Some(1024), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(event, MonitorEvent::Exited { code: Some(3) });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_memory_breach_while_running() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut probe = FixedProbe(Some(4096));
        let event = observe(&mut child, &mut probe, Some(1024), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            event,
            MonitorEvent::MemoryExceeded {
                rss: 4096,
                limit: 1024
            }
        );
        assert!(child.try_wait().unwrap().is_none());
        child.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sample_equal_to_limit_is_not_a_breach() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 0.2"])
            .spawn()
            .unwrap();
        let mut probe = FixedProbe(Some(1024));
        let event = observe(&mut child, &mut probe, Some(1024), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(event, MonitorEvent::Exited { code: Some(0) });
    }
}
