//! File watching for cache invalidation.
//!
//! The [`WatchBridge`] records which cached URLs depend on which files and
//! keeps the underlying [`Watcher`] subscribed to exactly the files that
//! have at least one dependant. Filenames are root-relative with `/`
//! separators.

mod native;

pub use native::NotifyWatcher;

use modserve_core::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A settled change to a watched file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchEvent {
    Changed(String),
    Removed(String),
}

impl WatchEvent {
    pub fn filename(&self) -> &str {
        match self {
            Self::Changed(f) | Self::Removed(f) => f,
        }
    }
}

/// File-level subscription to a change source.
pub trait Watcher: Send + Sync {
    fn watch(&self, filename: &str) -> Result<()>;
    fn unwatch(&self, filename: &str);
}

/// Relative filename to the set of URLs built from it.
pub struct WatchBridge {
    watcher: Arc<dyn Watcher>,
    dependants: Mutex<HashMap<String, HashSet<String>>>,
}

impl WatchBridge {
    pub fn new(watcher: Arc<dyn Watcher>) -> Self {
        Self {
            watcher,
            dependants: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `url` depends on `filename`. The first dependant starts
    /// the watch; if that fails nothing is recorded.
    pub fn register(&self, filename: &str, url: &str) -> Result<()> {
        let mut table = self.dependants.lock().unwrap();
        if let Some(urls) = table.get_mut(filename) {
            urls.insert(url.to_string());
            return Ok(());
        }
        self.watcher.watch(filename)?;
        debug!(filename = %filename, url = %url, "watching file");
        table.insert(filename.to_string(), HashSet::from([url.to_string()]));
        Ok(())
    }

    /// Drop one dependant. The file is unwatched when none remain.
    pub fn unregister(&self, filename: &str, url: &str) {
        let mut table = self.dependants.lock().unwrap();
        let Some(urls) = table.get_mut(filename) else {
            return;
        };
        if !urls.remove(url) || !urls.is_empty() {
            return;
        }
        table.remove(filename);
        self.watcher.unwatch(filename);
        debug!(filename = %filename, "unwatched file");
    }

    /// URLs depending on `filename`, sorted.
    pub fn dependants(&self, filename: &str) -> Vec<String> {
        let table = self.dependants.lock().unwrap();
        let mut urls: Vec<String> = table
            .get(filename)
            .map(|urls| urls.iter().cloned().collect())
            .unwrap_or_default();
        urls.sort();
        urls
    }

    pub fn is_watched(&self, filename: &str) -> bool {
        self.dependants.lock().unwrap().contains_key(filename)
    }

    /// Number of watched files.
    pub fn len(&self) -> usize {
        self.dependants.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watcher that records calls, for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingWatcher {
    pub calls: Mutex<Vec<String>>,
    pub fail: Mutex<HashSet<String>>,
}

#[cfg(test)]
impl RecordingWatcher {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Watcher for RecordingWatcher {
    fn watch(&self, filename: &str) -> Result<()> {
        if self.fail.lock().unwrap().contains(filename) {
            return Err(modserve_core::ServeError::Watch(format!("cannot watch {filename}")));
        }
        self.calls.lock().unwrap().push(format!("watch {filename}"));
        Ok(())
    }

    fn unwatch(&self, filename: &str) {
        self.calls.lock().unwrap().push(format!("unwatch {filename}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> (WatchBridge, Arc<RecordingWatcher>) {
        let watcher = Arc::new(RecordingWatcher::default());
        (WatchBridge::new(watcher.clone()), watcher)
    }

    #[test]
    fn test_watch_starts_with_first_dependant() {
        let (bridge, watcher) = bridge();
        bridge.register("src/a.js", "/src/a.js").unwrap();
        bridge.register("src/a.js", "/src/b.js").unwrap();
        bridge.register("src/a.js", "/src/b.js").unwrap();

        assert_eq!(watcher.calls(), vec!["watch src/a.js"]);
        assert_eq!(bridge.dependants("src/a.js"), vec!["/src/a.js", "/src/b.js"]);
    }

    #[test]
    fn test_unwatch_only_when_empty() {
        let (bridge, watcher) = bridge();
        bridge.register("src/a.js", "/src/a.js").unwrap();
        bridge.register("src/a.js", "/src/b.js").unwrap();

        bridge.unregister("src/a.js", "/src/a.js");
        assert_eq!(watcher.calls(), vec!["watch src/a.js"]);
        assert!(bridge.is_watched("src/a.js"));

        // Unknown url leaves the set alone.
        bridge.unregister("src/a.js", "/src/zzz.js");
        assert!(bridge.is_watched("src/a.js"));

        bridge.unregister("src/a.js", "/src/b.js");
        assert_eq!(watcher.calls(), vec!["watch src/a.js", "unwatch src/a.js"]);
        assert!(bridge.is_empty());

        bridge.unregister("src/a.js", "/src/b.js");
        assert_eq!(watcher.calls().len(), 2);
    }

    #[test]
    fn test_failed_watch_records_nothing() {
        let (bridge, watcher) = bridge();
        watcher.fail.lock().unwrap().insert("src/a.js".to_string());

        assert!(bridge.register("src/a.js", "/src/a.js").is_err());
        assert!(!bridge.is_watched("src/a.js"));
        assert!(bridge.dependants("src/a.js").is_empty());
    }
}
