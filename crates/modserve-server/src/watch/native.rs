//! [`Watcher`] backed by the platform file notification API.

use super::{WatchEvent, Watcher};
use modserve_core::paths::relative_filename;
use modserve_core::{Result, ServeError};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Event coalescing window.
const COALESCE_WINDOW_MS: u64 = 50;

/// Watches individual files by subscribing to their parent directories.
///
/// Directory watches survive editors that save by replacing the file, and
/// one directory watch serves every file in it.
pub struct NotifyWatcher {
    root: PathBuf,
    dirs: Mutex<DirWatches>,
    /// Absolute paths of watched files; events for anything else are dropped.
    files: Arc<Mutex<HashSet<PathBuf>>>,
}

struct DirWatches {
    watcher: RecommendedWatcher,
    counts: HashMap<PathBuf, usize>,
}

impl NotifyWatcher {
    /// Create the watcher and spawn its coalescing loop on the current
    /// tokio runtime.
    ///
    /// Settled events arrive on the returned receiver. The loop ends when
    /// the watcher is dropped or the receiver is closed.
    pub fn start(root: &Path) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let (tx, rx) = mpsc::unbounded_channel::<WatchEvent>();

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if should_process_event(&event) {
                        for path in event.paths {
                            // Closed only while shutting down.
                            let _ = raw_tx.send(path);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "watch error");
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| ServeError::Watch(e.to_string()))?;

        let files = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(process_events(
            raw_rx,
            tx,
            root.clone(),
            Arc::clone(&files),
        ));
        info!(root = %root.display(), "file watcher started");

        Ok((
            Self {
                root,
                dirs: Mutex::new(DirWatches {
                    watcher,
                    counts: HashMap::new(),
                }),
                files,
            },
            rx,
        ))
    }

    fn locate(&self, filename: &str) -> (PathBuf, PathBuf) {
        let path = self.root.join(filename);
        let dir = path
            .parent()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        (path, dir)
    }
}

impl Watcher for NotifyWatcher {
    fn watch(&self, filename: &str) -> Result<()> {
        let (path, dir) = self.locate(filename);
        let mut guard = self.dirs.lock().unwrap();
        let state = &mut *guard;
        if !state.counts.contains_key(&dir) {
            state
                .watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| ServeError::Watch(format!("{}: {e}", dir.display())))?;
            debug!(dir = %dir.display(), "watching directory");
        }
        *state.counts.entry(dir).or_insert(0) += 1;
        self.files.lock().unwrap().insert(path);
        Ok(())
    }

    fn unwatch(&self, filename: &str) {
        let (path, dir) = self.locate(filename);
        if !self.files.lock().unwrap().remove(&path) {
            return;
        }
        let mut guard = self.dirs.lock().unwrap();
        let state = &mut *guard;
        let Some(count) = state.counts.get_mut(&dir) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            state.counts.remove(&dir);
            if let Err(e) = state.watcher.unwatch(&dir) {
                debug!(dir = %dir.display(), error = %e, "unwatch failed");
            }
        }
    }
}

/// Collect raw paths until the window passes without new events, then
/// emit one settled event per watched file.
async fn process_events(
    mut raw: mpsc::UnboundedReceiver<PathBuf>,
    tx: mpsc::UnboundedSender<WatchEvent>,
    root: PathBuf,
    files: Arc<Mutex<HashSet<PathBuf>>>,
) {
    let window = Duration::from_millis(COALESCE_WINDOW_MS);
    let mut pending: HashSet<PathBuf> = HashSet::new();

    loop {
        match tokio::time::timeout(window, raw.recv()).await {
            Ok(Some(path)) => {
                pending.insert(path);
            }
            Ok(None) => {
                debug!("watch event channel closed");
                break;
            }
            Err(_) => {
                if pending.is_empty() {
                    continue;
                }
                debug!(count = pending.len(), "processing coalesced file events");

                let events: Vec<WatchEvent> = {
                    let files = files.lock().unwrap();
                    pending
                        .drain()
                        .filter(|path| files.contains(path))
                        .filter_map(|path| {
                            let name = relative_filename(&root, &path)?;
                            Some(if path.exists() {
                                WatchEvent::Changed(name)
                            } else {
                                WatchEvent::Removed(name)
                            })
                        })
                        .collect()
                };
                for event in events {
                    if tx.send(event).is_err() {
                        debug!("watch event receiver dropped");
                        return;
                    }
                }
            }
        }
    }
}

/// Check if we should process this event.
fn should_process_event(event: &Event) -> bool {
    match &event.kind {
        EventKind::Create(CreateKind::File | CreateKind::Any) => true,
        EventKind::Modify(
            ModifyKind::Data(_)
            | ModifyKind::Any
            | ModifyKind::Name(RenameMode::To | RenameMode::From | RenameMode::Both | RenameMode::Any),
        ) => true,
        EventKind::Remove(RemoveKind::File | RemoveKind::Any) => true,
        // Directories, metadata and access events
        _ => false,
    }
}
