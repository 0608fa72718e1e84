//! Change notifications for connected clients.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// A message telling clients that a URL has new content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event: String,
    pub url: String,
}

impl ChangeEvent {
    pub fn updated(url: impl Into<String>) -> Self {
        Self {
            event: "updated".to_string(),
            url: url.into(),
        }
    }

    /// Wire form, e.g. `{"event":"updated","url":"/src/App.js"}`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast side of the change channel. Delivery is best-effort: a slow
/// subscriber may miss events, and nothing is sent when nobody listens.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn updated(&self, url: &str) {
        if self.tx.send(ChangeEvent::updated(url)).is_err() {
            debug!(url = %url, "no change subscribers");
        }
    }
}
