//! Config file watching.
//!
//! While the dashboard runs, edits to the project file are picked up without a
//! restart: a background thread watches the file's directory, debounces bursts
//! of events and signals the async side, which reloads the registry into the
//! supervisor.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::ProjectRegistry;
use crate::supervisor::Supervisor;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Starts a thread that sends `()` on `tx` after each settled change to `path`.
pub fn spawn_config_watcher(path: PathBuf, debounce: Duration, tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        if let Err(err) = watch_config(&path, debounce, tx) {
            warn!(path = %path.display(), error = %err, "config watcher stopped");
        }
    });
}

fn watch_config(path: &Path, debounce: Duration, tx: mpsc::Sender<()>) -> Result<()> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("failed to resolve current dir")?
            .join(path)
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .with_context(|| format!("{} has no file name", path.display()))?;
    // Editors often replace the file, so watch the directory.
    let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();

    let (raw_tx, raw_rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = raw_tx.send(res);
        },
        notify::Config::default(),
    )
    .context("failed to create watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    debug!(path = %path.display(), "watching config file");

    let debounce = debounce.max(Duration::from_millis(50));
    loop {
        let event = match raw_rx.recv() {
            Ok(res) => res,
            Err(_) => break,
        };
        if !is_relevant(&event, &file_name) {
            continue;
        }

        let mut last = Instant::now();
        loop {
            let elapsed = last.elapsed();
            if elapsed >= debounce {
                break;
            }
            match raw_rx.recv_timeout(debounce - elapsed) {
                Ok(res) => {
                    if is_relevant(&res, &file_name) {
                        last = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }

        if tx.blocking_send(()).is_err() {
            break;
        }
    }

    Ok(())
}

fn is_relevant(event: &notify::Result<NotifyEvent>, file_name: &OsString) -> bool {
    let Ok(event) = event else {
        return true;
    };
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event
        .paths
        .iter()
        .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

/// Reloads the registry from `path` into `supervisor` each time `rx` fires.
/// A file that fails to load is reported and the previous registry stays.
pub async fn reload_on_change(path: PathBuf, supervisor: Arc<Supervisor>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        match ProjectRegistry::load(&path) {
            Ok(registry) => {
                info!(path = %path.display(), "project file changed");
                supervisor.reload(registry);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "keeping previous projects");
            }
        }
    }
}
