/// File Watcher (§4.3): recursively watches a directory for `*.md` changes, filtering out
/// VCS metadata and temp/system junk, and auto-restarts on transient `notify` failures up to
/// a configurable cap. Grounded in the same `notify` + `tokio::select!` shape used
/// throughout the crate's other long-running component loops.
pub mod debounce;

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::errors::{WatcherError, WatcherResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub event_type: FileEventKind,
    pub path: PathBuf,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Lifecycle per §4.3: `Stopped -> Starting -> Active <-> Paused`, with transient or fatal
/// error paths leading to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherLifecycle {
    Stopped,
    Starting,
    Active,
    Paused,
    Error,
}

const IGNORED_DIR_NAMES: &[&str] = &[".git", ".svn", ".hg", "node_modules", "target"];

fn is_ignored(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("md") {
        return true;
    }
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') || n.ends_with('~') || n.ends_with(".tmp") || n.ends_with(".swp"))
        .unwrap_or(false)
    {
        return true;
    }
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| IGNORED_DIR_NAMES.contains(&s))
            .unwrap_or(false)
    })
}

fn classify(event: &Event) -> Option<FileEventKind> {
    match event.kind {
        EventKind::Create(_) => Some(FileEventKind::Add),
        EventKind::Modify(_) => Some(FileEventKind::Change),
        EventKind::Remove(_) => Some(FileEventKind::Unlink),
        _ => None,
    }
}

/// Owns the underlying `notify` watcher plus restart bookkeeping. `run` drives the lifecycle
/// state machine and forwards filtered [`FileEvent`]s on `tx` until stopped or a fatal error
/// is reached.
pub struct FileWatcher {
    root: PathBuf,
    max_consecutive_failures: u32,
    restart_delay: Duration,
    lifecycle: WatcherLifecycle,
    consecutive_failures: u32,
}

impl FileWatcher {
    pub fn new(root: impl Into<PathBuf>, max_consecutive_failures: u32, restart_delay: Duration) -> Self {
        FileWatcher {
            root: root.into(),
            max_consecutive_failures,
            restart_delay,
            lifecycle: WatcherLifecycle::Stopped,
            consecutive_failures: 0,
        }
    }

    pub fn lifecycle(&self) -> WatcherLifecycle {
        self.lifecycle
    }

    pub fn pause(&mut self) {
        if self.lifecycle == WatcherLifecycle::Active {
            self.lifecycle = WatcherLifecycle::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.lifecycle == WatcherLifecycle::Paused {
            self.lifecycle = WatcherLifecycle::Active;
        }
    }

    /// Runs the watch loop until `shutdown` resolves or a fatal error is reached (emitting
    /// `watcher-failed` via the returned `Err`). A clean start resets the failure counter.
    pub async fn run(
        &mut self,
        tx: mpsc::Sender<FileEvent>,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> WatcherResult<()> {
        if !self.root.exists() {
            self.lifecycle = WatcherLifecycle::Error;
            return Err(WatcherError::PathNotFound(self.root.display().to_string()));
        }

        loop {
            self.lifecycle = WatcherLifecycle::Starting;
            let (notify_tx, mut notify_rx) = mpsc::channel(256);

            let watcher_result = self.spawn_watcher(notify_tx);
            let mut watcher = match watcher_result {
                Ok(w) => w,
                Err(e) => {
                    self.consecutive_failures += 1;
                    warn!(error = %e, attempt = self.consecutive_failures, "watcher start failed");
                    if self.consecutive_failures >= self.max_consecutive_failures {
                        self.lifecycle = WatcherLifecycle::Error;
                        error!("watcher-failed: too many consecutive restarts");
                        return Err(WatcherError::TooManyFailures(self.consecutive_failures));
                    }
                    tokio::time::sleep(self.restart_delay).await;
                    continue;
                }
            };

            self.lifecycle = WatcherLifecycle::Active;
            self.consecutive_failures = 0;
            info!(root = %self.root.display(), "file watcher active");

            let restart = loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        self.lifecycle = WatcherLifecycle::Stopped;
                        return Ok(());
                    }
                    maybe_event = notify_rx.recv() => {
                        match maybe_event {
                            Some(Ok(event)) => {
                                if self.lifecycle == WatcherLifecycle::Paused {
                                    continue;
                                }
                                if let Some(kind) = classify(&event) {
                                    for path in &event.paths {
                                        if is_ignored(path) {
                                            continue;
                                        }
                                        let file_event = FileEvent {
                                            event_type: kind,
                                            path: path.clone(),
                                            timestamp: chrono::Utc::now(),
                                        };
                                        if tx.send(file_event).await.is_err() {
                                            return Ok(());
                                        }
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "notify error, scheduling restart");
                                break true;
                            }
                            None => break true,
                        }
                    }
                }
            };

            drop(watcher);
            if restart {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.max_consecutive_failures {
                    self.lifecycle = WatcherLifecycle::Error;
                    error!("watcher-failed: too many consecutive restarts");
                    return Err(WatcherError::TooManyFailures(self.consecutive_failures));
                }
                tokio::time::sleep(self.restart_delay).await;
            }
        }
    }

    fn spawn_watcher(
        &self,
        notify_tx: mpsc::Sender<notify::Result<Event>>,
    ) -> WatcherResult<RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.blocking_send(res);
        })
        .map_err(|e| WatcherError::Notify(e.to_string()))?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::Notify(e.to_string()))?;
        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_files_are_not_ignored() {
        assert!(!is_ignored(Path::new("docs/task.md")));
    }

    #[test]
    fn non_markdown_and_vcs_paths_are_ignored() {
        assert!(is_ignored(Path::new("src/main.rs")));
        assert!(is_ignored(Path::new(".git/HEAD")));
        assert!(is_ignored(Path::new("docs/.hidden.md")));
        assert!(is_ignored(Path::new("docs/task.md~")));
    }

    #[tokio::test]
    async fn missing_root_path_is_a_fatal_error() {
        let mut watcher = FileWatcher::new("/nonexistent/path/xyz", 3, Duration::from_millis(10));
        let (tx, _rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let result = watcher.run(tx, shutdown_rx).await;
        assert!(matches!(result, Err(WatcherError::PathNotFound(_))));
    }
}
