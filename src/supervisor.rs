//! Per-app supervision loop.
//!
//! Each app gets one `Supervisor` running on its own task. The task owns the
//! child process, so spawning and terminating an app is always sequential:
//! a new process is spawned only after the previous one has been reaped.
//! Restart requests arrive over a small bounded channel. Shutdown is a latched
//! flag on a `watch` channel and takes priority over everything else, so it
//! cannot be crowded out by queued restarts.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::events::Event;
use crate::monitor::{self, MemoryProbe, MonitorEvent};
use crate::process::{AppEntry, ProcessStatus, StopReason};
use crate::restart::{Decision, RestartTracker, RunOutcome};
use crate::runner;

/// Asks a supervisor to replace its process, or to start it again if it is
/// waiting for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequest;

enum Wake {
    Monitor(std::io::Result<MonitorEvent>),
    Restart,
    Shutdown,
}

/// The senders that drive one supervisor.
pub struct Controls {
    restart: mpsc::Sender<RestartRequest>,
    shutdown: watch::Sender<bool>,
}

impl Controls {
    /// A sender for restart requests, used by file watchers.
    pub fn restarts(&self) -> mpsc::Sender<RestartRequest> {
        self.restart.clone()
    }

    /// Latches the shutdown flag. Never blocks and is never dropped.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Supervises one app.
pub struct Supervisor<P> {
    id: usize,
    entry: AppEntry,
    env: BTreeMap<String, String>,
    probe: P,
    memory_interval: Duration,
    events: mpsc::Sender<Event>,
    restarts: mpsc::Receiver<RestartRequest>,
    shutdown: watch::Receiver<bool>,
    tracker: RestartTracker,
    status: ProcessStatus,
}

impl<P> Supervisor<P>
where
    P: MemoryProbe + 'static,
{
    /// Creates a supervisor and the controls used to drive it.
    pub fn new(
        id: usize,
        entry: AppEntry,
        env: BTreeMap<String, String>,
        probe: P,
        memory_interval: Duration,
        events: mpsc::Sender<Event>,
    ) -> (Self, Controls) {
        // One slot is enough: a queued restart already covers later changes.
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = RestartTracker::new(entry.restart.clone());
        let supervisor = Self {
            id,
            entry,
            env,
            probe,
            memory_interval,
            events,
            restarts: restart_rx,
            shutdown: shutdown_rx,
            tracker,
            status: ProcessStatus::Stopped,
        };
        let controls = Controls {
            restart: restart_tx,
            shutdown: shutdown_tx,
        };
        (supervisor, controls)
    }

    /// Runs the app until its restart policy or a shutdown request stops it.
    ///
    /// Apps with `watch` enabled are not finished by their policy. They wait
    /// for the next restart request instead. Dropping the `Controls` counts
    /// as a shutdown request.
    pub async fn run(mut self) -> StopReason {
        loop {
            if self.shutdown_pending() {
                return self.finish(StopReason::Shutdown).await;
            }
            // Requests queued before this spawn are satisfied by it.
            while self.restarts.try_recv().is_ok() {}

            self.set_status(ProcessStatus::Starting);
            self.emit(Event::ProcessStarting { id: self.id }).await;
            let started_at = Instant::now();

            let outcome = match runner::spawn(self.id, &self.entry, &self.env, &self.events) {
                Err(err) => {
                    error!(app = %self.entry.name, kind = ?err.kind(), "{}", err);
                    self.emit(Event::SpawnFailed {
                        id: self.id,
                        error: err.to_string(),
                    })
                    .await;
                    RunOutcome::SpawnFailed
                }
                Ok(child) => match self.supervise(child, started_at).await {
                    Some(outcome) => outcome,
                    None => return self.finish(StopReason::Shutdown).await,
                },
            };

            let mut decision = self.tracker.decide(outcome, started_at.elapsed());
            if let Decision::Stop(reason) = decision {
                if !self.entry.watch.is_enabled() {
                    return self.finish(reason).await;
                }
                if !self.wait_for_change(reason).await {
                    return self.finish(StopReason::Shutdown).await;
                }
                decision = self
                    .tracker
                    .decide(RunOutcome::RestartRequested, Duration::ZERO);
            }

            if let Decision::Restart { delay, attempt } = decision {
                self.set_status(ProcessStatus::Restarting);
                self.emit(Event::Restarting {
                    id: self.id,
                    delay,
                    attempt,
                })
                .await;
                if !self.wait_before_restart(delay).await {
                    return self.finish(StopReason::Shutdown).await;
                }
            }
        }
    }

    // Monitors a spawned child until it is gone. `None` means shut down.
    async fn supervise(&mut self, mut child: Child, started_at: Instant) -> Option<RunOutcome> {
        let pid = child.id().unwrap_or(0);
        self.set_status(ProcessStatus::Running);
        self.emit(Event::ProcessStarted { id: self.id, pid }).await;

        let wake = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => Wake::Shutdown,
            res = monitor::observe(
                &mut child,
                &mut self.probe,
                self.entry.max_memory_bytes,
                self.memory_interval,
            ) => Wake::Monitor(res),
            req = self.restarts.recv() => match req {
                Some(RestartRequest) => Wake::Restart,
                None => Wake::Shutdown,
            },
        };

        let outcome = match wake {
            Wake::Monitor(Ok(MonitorEvent::Exited { code })) => {
                self.emit_exit(code, started_at).await;
                RunOutcome::Exited { code }
            }
            Wake::Monitor(Ok(MonitorEvent::MemoryExceeded { rss, limit })) => {
                self.emit(Event::MemoryExceeded {
                    id: self.id,
                    rss,
                    limit,
                })
                .await;
                let code = self.stop_child(&mut child, true).await;
                self.emit_exit(code, started_at).await;
                RunOutcome::MemoryExceeded
            }
            Wake::Monitor(Err(err)) => {
                warn!(app = %self.entry.name, error = %err, "lost track of process");
                let code = self.stop_child(&mut child, true).await;
                self.emit_exit(code, started_at).await;
                RunOutcome::Exited { code }
            }
            Wake::Restart => {
                let code = self.stop_child(&mut child, false).await;
                self.emit_exit(code, started_at).await;
                RunOutcome::RestartRequested
            }
            Wake::Shutdown => {
                let code = self.stop_child(&mut child, false).await;
                self.emit_exit(code, started_at).await;
                return None;
            }
        };
        Some(outcome)
    }

    // Sleeps out the restart delay. Returns false when asked to shut down.
    async fn wait_before_restart(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.shutdown_pending();
        }
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
            req = self.restarts.recv() => req.is_some(),
        }
    }

    // Parks a stopped app until a restart request. Returns false on shutdown.
    async fn wait_for_change(&mut self, reason: StopReason) -> bool {
        self.set_status(ProcessStatus::Stopped);
        self.emit(Event::Waiting {
            id: self.id,
            reason,
        })
        .await;
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.shutdown) => false,
            req = self.restarts.recv() => req.is_some(),
        }
    }

    async fn stop_child(&mut self, child: &mut Child, force: bool) -> Option<i32> {
        match runner::terminate(self.id, child, &self.entry.shutdown, force, &self.events).await {
            Ok(code) => code,
            Err(err) => {
                warn!(app = %self.entry.name, error = %err, "failed to reap process");
                None
            }
        }
    }

    fn shutdown_pending(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn emit_exit(&mut self, code: Option<i32>, started_at: Instant) {
        self.emit(Event::ProcessExited {
            id: self.id,
            code,
            uptime: started_at.elapsed(),
        })
        .await;
    }

    async fn finish(&mut self, reason: StopReason) -> StopReason {
        self.set_status(ProcessStatus::Stopped);
        self.emit(Event::Stopped {
            id: self.id,
            reason,
        })
        .await;
        reason
    }

    fn set_status(&mut self, status: ProcessStatus) {
        debug!(app = %self.entry.name, from = ?self.status, to = ?status, restarts = self.tracker.restarts(), "status");
        self.status = status;
    }

    // Takes `&mut self` so the `run` future only needs `P: Send`.
    async fn emit(&mut self, event: Event) {
        let _ = self.events.send(event).await;
    }
}

// Resolves once shutdown is latched or the controls are gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// A supervisor running on its own task.
pub struct SupervisorHandle {
    controls: Controls,
    task: JoinHandle<StopReason>,
}

impl SupervisorHandle {
    /// Spawns `supervisor` onto the runtime.
    pub fn spawn<P>(supervisor: Supervisor<P>, controls: Controls) -> Self
    where
        P: MemoryProbe + 'static,
    {
        Self {
            controls,
            task: tokio::spawn(supervisor.run()),
        }
    }

    /// A sender for restart requests, used by file watchers.
    pub fn restarts(&self) -> mpsc::Sender<RestartRequest> {
        self.controls.restarts()
    }

    /// Asks the supervisor to stop its process and finish.
    pub fn shutdown(&self) {
        self.controls.shutdown();
    }

    /// Abandons supervision at once. The child is killed when its handle drops.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the supervisor to finish. `None` if it was aborted.
    pub async fn join(self) -> Option<StopReason> {
        self.task.await.ok()
    }
}
