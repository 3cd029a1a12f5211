//! File watching and auto-restart functionality.
//!
//! Apps with `watch` enabled get a background thread that monitors their
//! paths. Once relevant changes go quiet for the debounce interval, the thread
//! sends a `RestartRequest` to the app's supervisor. Apps with watching
//! disabled get no thread at all.

use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::process::AppEntry;
use crate::supervisor::RestartRequest;

const MIN_DEBOUNCE: Duration = Duration::from_millis(50);

/// Starts a watcher thread for `entry`, or returns `None` if watching is disabled.
pub fn spawn_watcher(
    entry: &AppEntry,
    restarts: mpsc::Sender<RestartRequest>,
) -> Option<JoinHandle<()>> {
    if !entry.watch.is_enabled() {
        return None;
    }
    let entry = entry.clone();
    Some(std::thread::spawn(move || {
        if let Err(err) = run_watcher(&entry, restarts) {
            warn!(app = %entry.name, error = %err, "watcher failed");
        }
    }))
}

fn run_watcher(entry: &AppEntry, restarts: mpsc::Sender<RestartRequest>) -> Result<()> {
    let base = match &entry.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir().context("failed to resolve current dir")?,
    };
    let filter = ChangeFilter::new(&base, &entry.watch.ignore, entry.watch.gitignore)?;

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    for path in &entry.watch.paths {
        watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", path.display()))?;
    }

    let quiet = Duration::from_millis(entry.watch.debounce_ms).max(MIN_DEBOUNCE);
    // Set while changes are pending; the restart fires once it passes.
    let mut deadline: Option<Instant> = None;
    loop {
        let received = match deadline {
            Some(at) => raw_rx.recv_timeout(at.saturating_duration_since(Instant::now())),
            None => raw_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(event) => {
                if filter.is_relevant(&event) {
                    deadline = Some(Instant::now() + quiet);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                deadline = None;
                info!(app = %entry.name, "change detected, restarting");
                match restarts.try_send(RestartRequest) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!(app = %entry.name, "restart already pending");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

/// Decides which filesystem events count as changes.
struct ChangeFilter {
    base: PathBuf,
    globs: GlobSet,
    gitignore: Gitignore,
}

impl ChangeFilter {
    fn new(base: &Path, patterns: &[String], use_gitignore: bool) -> Result<Self> {
        let mut globs = GlobSetBuilder::new();
        for glob in patterns.iter().flat_map(|pattern| glob_variants(pattern)) {
            globs.add(Glob::new(&glob).with_context(|| format!("invalid ignore_watch `{}`", glob))?);
        }
        let gitignore = if use_gitignore {
            gitignore_for(base)?
        } else {
            Gitignore::empty()
        };
        Ok(Self {
            base: base.to_path_buf(),
            globs: globs.build()?,
            gitignore,
        })
    }

    // Errors are passed through so a broken watch still restarts the app.
    fn is_relevant(&self, event: &notify::Result<NotifyEvent>) -> bool {
        match event {
            Err(_) => true,
            Ok(event) if event.kind.is_access() => false,
            Ok(event) => event.paths.is_empty() || event.paths.iter().any(|p| !self.ignores(p)),
        }
    }

    fn ignores(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.base).ok();
        if self.globs.is_match(path) || relative.is_some_and(|rel| self.globs.is_match(rel)) {
            return true;
        }
        relative.is_some()
            && self
                .gitignore
                .matched_path_or_any_parents(path, path.is_dir())
                .is_ignore()
    }
}

// A bare name like `logs/` also ignores everything beneath it.
fn glob_variants(pattern: &str) -> Vec<String> {
    if pattern.contains(['*', '?', '[']) {
        return vec![pattern.to_string()];
    }
    let dir = pattern.trim_end_matches('/');
    vec![dir.to_string(), format!("{}/**", dir)]
}

// Rules from every `.gitignore` and `.git/info/exclude` at or above `base`.
fn gitignore_for(base: &Path) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(base);
    let candidates = base.ancestors().flat_map(|dir| {
        [
            dir.join(".gitignore"),
            dir.join(".git").join("info").join("exclude"),
        ]
    });
    for file in candidates.filter(|file| file.is_file()) {
        if let Some(err) = builder.add(&file) {
            warn!(path = %file.display(), error = %err, "skipping unreadable ignore file");
        }
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, EventKind};

    fn event(kind: EventKind, path: &Path) -> notify::Result<NotifyEvent> {
        Ok(NotifyEvent::new(kind).add_path(path.to_path_buf()))
    }

    #[test]
    fn disabled_watch_spawns_nothing() {
        let (tx, _rx) = mpsc::channel(1);
        let entry = AppEntry::new("gen", "python");
        assert!(!entry.watch.is_enabled());
        assert!(spawn_watcher(&entry, tx).is_none());
    }

    #[test]
    fn bare_names_also_cover_their_contents() {
        assert_eq!(glob_variants("logs/"), vec!["logs".to_string(), "logs/**".to_string()]);
        assert_eq!(glob_variants("*.pyc"), vec!["*.pyc".to_string()]);
    }

    #[test]
    fn filter_respects_ignore_globs() {
        let base = Path::new("/srv/warden-tests");
        let filter =
            ChangeFilter::new(base, &["__pycache__".to_string(), "*.log".to_string()], false)
                .unwrap();
        assert!(filter.ignores(&base.join("__pycache__/server.pyc")));
        assert!(filter.ignores(&base.join("out.log")));
        assert!(!filter.ignores(&base.join("app/server.py")));
    }

    #[test]
    fn access_events_and_ignored_paths_are_not_changes() {
        let base = Path::new("/srv/warden-tests");
        let filter = ChangeFilter::new(base, &["*.log".to_string()], false).unwrap();
        let source = base.join("app/server.py");
        assert!(!filter.is_relevant(&event(EventKind::Access(AccessKind::Any), &source)));
        assert!(!filter.is_relevant(&event(EventKind::Create(CreateKind::File), &base.join("a.log"))));
        assert!(filter.is_relevant(&event(EventKind::Create(CreateKind::File), &source)));
    }

    #[test]
    fn filter_reads_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "outputs/\n").unwrap();
        std::fs::create_dir(dir.path().join("outputs")).unwrap();
        let filter = ChangeFilter::new(dir.path(), &[], true).unwrap();
        assert!(filter.ignores(&dir.path().join("outputs/mesh.ply")));
        assert!(!filter.ignores(&dir.path().join("server.py")));
    }

    #[test]
    fn watcher_sends_restart_after_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = AppEntry::new("gen", "python");
        entry.cwd = Some(dir.path().to_path_buf());
        entry.watch.paths = vec![dir.path().to_path_buf()];
        entry.watch.debounce_ms = 50;
        let (tx, mut rx) = mpsc::channel(1);
        let _watcher = spawn_watcher(&entry, tx).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut attempt = 0;
        while Instant::now() < deadline {
            attempt += 1;
            std::fs::write(dir.path().join("server.py"), format!("print({})", attempt)).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            if rx.try_recv().is_ok() {
                return;
            }
        }
        panic!("no restart request after writing to a watched file");
    }
}
