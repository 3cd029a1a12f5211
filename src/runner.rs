//! Process launching and termination.
//!
//! This module builds the command line of an entry, spawns it with its
//! resolved environment, forwards its output to the event channel, and stops
//! it with a signal followed by SIGKILL once the grace period runs out.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::SpawnError;
use crate::events::{Event, ProcessSignal};
use crate::output::StreamKind;
use crate::process::{AppEntry, Interpreter, ShutdownSettings};

/// Program and arguments actually executed for `entry`.
pub fn command_line(entry: &AppEntry) -> (String, Vec<String>) {
    match &entry.interpreter {
        Interpreter::Direct => (entry.command.clone(), entry.args.clone()),
        Interpreter::Program(program) => {
            let mut args = Vec::with_capacity(1 + entry.args.len());
            args.push(entry.command.clone());
            args.extend(entry.args.iter().cloned());
            (program.clone(), args)
        }
    }
}

/// Shell-quoted rendering of the command line, for display.
pub fn format_command(entry: &AppEntry) -> String {
    let (program, args) = command_line(entry);
    let mut parts = Vec::with_capacity(1 + args.len());
    parts.push(program);
    parts.extend(args);
    shell_words::join(parts)
}

/// Spawns the process for `entry` with `env` layered over the inherited environment.
///
/// Standard output and error are captured and forwarded to `events` line by line.
pub fn spawn(
    id: usize,
    entry: &AppEntry,
    env: &BTreeMap<String, String>,
    events: &mpsc::Sender<Event>,
) -> Result<Child, SpawnError> {
    let (program, args) = command_line(entry);
    let mut command = Command::new(&program);
    command.args(&args);
    if let Some(cwd) = &entry.cwd {
        command.current_dir(cwd);
    }
    command.envs(env);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|source| SpawnError {
        name: entry.name.clone(),
        program: program.clone(),
        source,
    })?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(read_stream(id, StreamKind::Stdout, stdout, events.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(read_stream(id, StreamKind::Stderr, stderr, events.clone()));
    }
    Ok(child)
}

/// Stops `child` and reaps it.
///
/// Unless `force` is set, the configured signal is sent first and the child
/// gets `settings.timeout` to exit. Whatever is still alive afterwards is
/// killed. Returns the exit code, if the child reported one.
pub async fn terminate(
    id: usize,
    child: &mut Child,
    settings: &ShutdownSettings,
    force: bool,
    events: &mpsc::Sender<Event>,
) -> std::io::Result<Option<i32>> {
    if let Some(status) = child.try_wait()? {
        return Ok(status.code());
    }

    if !force && settings.signal != ProcessSignal::SigKill {
        if let Some(pid) = child.id() {
            let _ = events
                .send(Event::ProcessSignal {
                    id,
                    signal: settings.signal,
                })
                .await;
            send_os_signal(pid, settings.signal);
        }
        if let Some(status) = wait_for_exit(child, settings.timeout).await? {
            return Ok(status.code());
        }
    }

    if let Some(pid) = child.id() {
        let _ = events
            .send(Event::ProcessSignal {
                id,
                signal: ProcessSignal::SigKill,
            })
            .await;
        send_os_signal(pid, ProcessSignal::SigKill);
    }
    let _ = child.start_kill();
    let status = child.wait().await?;
    Ok(status.code())
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigKill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // SIGKILL is handled by Child::start_kill.
    if signal == ProcessSignal::SigKill {
        return;
    }
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: ProcessSignal) {}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

async fn read_stream<R>(id: usize, stream: StreamKind, reader: R, tx: mpsc::Sender<Event>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx
            .send(Event::ProcessOutput { id, line, stream })
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_entries_run_the_command() {
        let mut entry = AppEntry::new("gen", "python");
        entry.args = vec!["-m".to_string(), "app.server".to_string()];
        assert_eq!(
            command_line(&entry),
            ("python".to_string(), vec!["-m".to_string(), "app.server".to_string()])
        );
        assert_eq!(format_command(&entry), "python -m app.server");
    }

    #[test]
    fn interpreter_prefixes_the_script() {
        let mut entry = AppEntry::new("api", "server.py");
        entry.interpreter = Interpreter::Program("python3".to_string());
        entry.args = vec!["--name".to_string(), "my app".to_string()];
        assert_eq!(format_command(&entry), "python3 server.py --name 'my app'");
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let (tx, _rx) = mpsc::channel(8);
        let entry = AppEntry::new("ghost", "warden-test-no-such-binary");
        let err = spawn(0, &entry, &BTreeMap::new(), &tx).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert_eq!(err.name, "ghost");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwards_output_with_resolved_env() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut entry = AppEntry::new("echo", "sh");
        entry.args = vec!["-c".to_string(), "echo $GREETING".to_string()];
        let env = BTreeMap::from([("GREETING".to_string(), "hello".to_string())]);
        let mut child = spawn(3, &entry, &env, &tx).unwrap();
        child.wait().await.unwrap();
        match rx.recv().await {
            Some(Event::ProcessOutput { id, line, stream }) => {
                assert_eq!(id, 3);
                assert_eq!(line, "hello");
                assert_eq!(stream, StreamKind::Stdout);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_terminate_signals_then_reaps() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut entry = AppEntry::new("sleeper", "sleep");
        entry.args = vec!["30".to_string()];
        let mut child = spawn(0, &entry, &BTreeMap::new(), &tx).unwrap();
        let settings = ShutdownSettings {
            signal: ProcessSignal::SigTerm,
            timeout: Duration::from_secs(5),
        };
        let started = std::time::Instant::now();
        terminate(0, &mut child, &settings, false, &tx).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
        assert!(matches!(
            rx.recv().await,
            Some(Event::ProcessSignal {
                signal: ProcessSignal::SigTerm,
                ..
            })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forced_terminate_skips_grace_period() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut entry = AppEntry::new("stubborn", "sh");
        entry.args = vec!["-c".to_string(), "trap '' INT TERM; sleep 30".to_string()];
        let mut child = spawn(0, &entry, &BTreeMap::new(), &tx).unwrap();
        let settings = ShutdownSettings {
            signal: ProcessSignal::SigInt,
            timeout: Duration::from_secs(30),
        };
        let code = terminate(0, &mut child, &settings, true, &tx).await.unwrap();
        assert_eq!(code, None);
        assert!(matches!(
            rx.recv().await,
            Some(Event::ProcessSignal {
                signal: ProcessSignal::SigKill,
                ..
            })
        ));
    }
}
