use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_types::event::{Event, EventKind};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Suffixes SQLite appends for its side files.
const SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-journal", "-shm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    /// The database (or one of its side files) was written
    DatabaseChanged(PathBuf),
    /// An error occurred
    Error(String),
}

/// Watches the directory holding the database and reports writes to it.
pub struct DbWatcher {
    _watcher: RecommendedWatcher,
    event_rx: Receiver<WatcherEvent>,
}

impl DbWatcher {
    pub fn new(db_path: &Path) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel();

        let file_name = db_path
            .file_name()
            .with_context(|| format!("{} is not a file path", db_path.display()))?;
        let dir = match db_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        // Events carry canonical paths on some platforms
        let dir = dir.canonicalize().unwrap_or(dir);
        let db_path = dir.join(file_name);

        let watched = db_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => handle_fs_event(event, &event_tx, &watched),
                Err(e) => {
                    let _ = event_tx.send(WatcherEvent::Error(format!("Watch error: {e}")));
                }
            })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Could not watch directory {}", dir.display()))?;
        debug!(db = %db_path.display(), "Watching database for changes");

        Ok(Self {
            _watcher: watcher,
            event_rx,
        })
    }

    pub fn try_recv(&self) -> Option<WatcherEvent> {
        self.event_rx.try_recv().ok()
    }
}

fn handle_fs_event(event: Event, tx: &Sender<WatcherEvent>, db_path: &Path) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in &event.paths {
        if is_database_file(path, db_path) {
            let _ = tx.send(WatcherEvent::DatabaseChanged(path.clone()));
        }
    }
}

/// True for the database itself and its `-wal`/`-journal`/`-shm` files.
fn is_database_file(path: &Path, db_path: &Path) -> bool {
    if path == db_path {
        return true;
    }
    let (Some(name), Some(db_name)) = (path.file_name(), db_path.file_name()) else {
        return false;
    };
    if path.parent() != db_path.parent() {
        return false;
    }
    let (name, db_name) = (name.to_string_lossy(), db_name.to_string_lossy());
    SIDE_FILE_SUFFIXES
        .iter()
        .any(|suffix| name.strip_suffix(suffix) == Some(db_name.as_ref()))
}

/// Collapses bursts of database writes into a single notification, fired
/// once no write has been seen for `quiet`.
#[derive(Debug)]
pub struct ChangeDebouncer {
    quiet: Duration,
    last_change: Option<Instant>,
}

impl ChangeDebouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            last_change: None,
        }
    }

    pub fn handle_watcher_event(&mut self, event: WatcherEvent, now: Instant) {
        match event {
            WatcherEvent::DatabaseChanged(path) => {
                debug!(path = %path.display(), "Database changed");
                self.last_change = Some(now);
            }
            WatcherEvent::Error(err) => warn!("Database watcher error: {err}"),
        }
    }

    /// Whether a pending change is due; clears it when it is.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.last_change {
            Some(last) if now.duration_since(last) >= self.quiet => {
                self.last_change = None;
                true
            }
            _ => false,
        }
    }
}
