//! Persisted specifier → URL table.
//!
//! Stored as `<out_dir>/import-map.json` in the browser import-map shape,
//! plus the list of ids decided to be served unbundled:
//!
//! ```json
//! {
//!   "imports": { "lodash": "/web_modules/lodash/lodash.js" },
//!   "passthrough": ["some-asset-pkg"]
//! }
//! ```

use crate::config::ServerConfig;
use crate::error::{Result, ServeError};
use crate::paths::{package_name, split_url, WEB_MODULES_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMap {
    #[serde(default)]
    imports: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    passthrough: BTreeSet<String>,
}

impl ImportMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the persisted map, dropping entries whose bundle is gone.
    ///
    /// Pass-through decisions only survive for packages still on the
    /// external list. Any other id was unbundleable at the time, e.g. not
    /// installed yet, and gets looked at again.
    ///
    /// A missing file yields an empty map. An unreadable one is logged and
    /// replaced on the next persist.
    pub fn load(config: &ServerConfig) -> Self {
        let path = config.import_map_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read import map, starting empty");
                return Self::new();
            }
        };

        let mut map: Self = match serde_json::from_str(&content) {
            Ok(map) => map,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid import map, starting empty");
                return Self::new();
            }
        };

        map.imports.retain(|key, url| {
            let present = artifact_path(config, url).is_file();
            if !present {
                warn!(key = %key, url = %url, "dropping import map entry with missing bundle");
            }
            present
        });
        map.passthrough.retain(|id| {
            let keep = config.is_external(&package_name(id));
            if !keep {
                debug!(id = %id, "forgetting pass-through decision");
            }
            keep
        });
        debug!(
            entries = map.imports.len(),
            passthrough = map.passthrough.len(),
            "loaded import map"
        );
        map
    }

    /// Write the map atomically.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ServeError::Io {
            path: path.to_path_buf(),
            source: std::sync::Arc::new(std::io::Error::other(e)),
        })?;
        modserve_util::fs::write_atomic(path, json.as_bytes()).map_err(|e| ServeError::io(path, e))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.imports.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_passthrough(&self, id: &str) -> bool {
        self.passthrough.contains(id)
    }

    /// Whether `id` has reached a terminal state (bundled or pass-through).
    #[must_use]
    pub fn knows(&self, id: &str) -> bool {
        self.imports.contains_key(id) || self.passthrough.contains(id)
    }

    pub fn insert(&mut self, key: impl Into<String>, url: impl Into<String>) {
        self.imports.insert(key.into(), url.into());
    }

    pub fn mark_passthrough(&mut self, id: impl Into<String>) {
        self.passthrough.insert(id.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.imports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.imports.is_empty() && self.passthrough.is_empty()
    }
}

/// File backing a bundle URL.
#[must_use]
pub fn artifact_path(config: &ServerConfig, url: &str) -> PathBuf {
    let (pathname, _) = split_url(url);
    match pathname.strip_prefix(WEB_MODULES_PREFIX) {
        Some(rest) => config.web_modules_dir().join(rest),
        None => config.root.join(pathname.trim_start_matches('/')),
    }
}
