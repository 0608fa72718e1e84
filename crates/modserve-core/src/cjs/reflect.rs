//! Runtime export reflection.
//!
//! Loads a CommonJS module in a real runtime and reads its own keys. Only
//! used when static discovery finds nothing.

use crate::error::{Result, ServeError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Enumerates a module's exported names by executing it.
#[async_trait]
pub trait ExportReflector: Send + Sync {
    /// Own enumerable keys of `module.exports`, without `default` and
    /// `__esModule`.
    async fn reflect(&self, entry: &Path) -> Result<Vec<String>>;
}

/// Script run by the reflector. The module path arrives as `argv[1]`.
const REFLECT_SCRIPT: &str = r#"
const m = require(process.argv[1]);
const keys = m && (typeof m === "object" || typeof m === "function") ? Object.keys(m) : [];
process.stdout.write(JSON.stringify(keys.filter((k) => k !== "default" && k !== "__esModule")));
"#;

/// Reflector backed by a `node` child process.
#[derive(Debug, Clone)]
pub struct NodeReflector {
    node: PathBuf,
    timeout: Duration,
}

impl NodeReflector {
    /// Locate `node` on `PATH`. Returns `None` when it is not installed.
    #[must_use]
    pub fn from_path(timeout: Duration) -> Option<Self> {
        which::which("node")
            .ok()
            .map(|node| Self::with_binary(node, timeout))
    }

    /// Use a specific `node` executable.
    #[must_use]
    pub fn with_binary(node: PathBuf, timeout: Duration) -> Self {
        Self { node, timeout }
    }
}

#[async_trait]
impl ExportReflector for NodeReflector {
    async fn reflect(&self, entry: &Path) -> Result<Vec<String>> {
        let cwd = entry.parent().unwrap_or(Path::new("."));
        let child = Command::new(&self.node)
            .arg("-e")
            .arg(REFLECT_SCRIPT)
            .arg(entry)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ServeError::Timeout {
                key: entry.display().to_string(),
                millis: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(|e| ServeError::io(&self.node, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServeError::Transform {
                filename: entry.to_path_buf(),
                message: format!("export reflection failed: {}", stderr.trim()),
            });
        }

        let keys: Vec<String> =
            serde_json::from_slice(&output.stdout).map_err(|e| ServeError::Transform {
                filename: entry.to_path_buf(),
                message: format!("unreadable reflection output: {e}"),
            })?;
        debug!(entry = %entry.display(), count = keys.len(), "reflected exports");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn node() -> Option<NodeReflector> {
        let node = which::which("node").ok()?;
        Some(NodeReflector::with_binary(node, Duration::from_secs(10)))
    }

    #[tokio::test]
    async fn test_reflects_runtime_keys() {
        let Some(reflector) = node() else {
            return;
        };
        let dir = tempdir().unwrap();
        let entry = dir.path().join("built.js");
        std::fs::write(
            &entry,
            "module.exports = build();\n\
             function build() { return { a: 1, b: 2, default: 3, __esModule: true }; }\n",
        )
        .unwrap();

        let keys = reflector.reflect(&entry).await.unwrap();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_throwing_module_is_a_transform_error() {
        let Some(reflector) = node() else {
            return;
        };
        let dir = tempdir().unwrap();
        let entry = dir.path().join("broken.js");
        std::fs::write(&entry, "throw new Error('boom');\n").unwrap();

        let err = reflector.reflect(&entry).await.unwrap_err();
        assert!(matches!(err, ServeError::Transform { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_io_error() {
        let dir = tempdir().unwrap();
        let entry = dir.path().join("a.js");
        std::fs::write(&entry, "module.exports = {};").unwrap();
        let reflector =
            NodeReflector::with_binary(dir.path().join("no-such-node"), Duration::from_secs(5));

        let err = reflector.reflect(&entry).await.unwrap_err();
        assert!(matches!(err, ServeError::Io { .. }));
    }
}
