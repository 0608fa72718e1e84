use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Name of the optional config file looked up in the workspace root.
pub const CONFIG_FILE: &str = "modserve.config.json";

/// Response body compression applied to cached resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
        }
    }
}

/// Configuration for one module server instance.
///
/// Every component takes this by value (usually behind an `Arc`); there is
/// no process-wide instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Workspace root. Every served URL is relative to it.
    pub root: PathBuf,

    /// Keep built resources in memory and watch their files.
    pub cache: bool,

    /// Body compression for served resources.
    pub compression: Compression,

    /// Script extensions, in resolution probe order. A file with one of
    /// these extensions is served as an ES module; anything else imported
    /// from a script gets the `?type=module` marker.
    pub extensions: Vec<String>,

    /// Packages that are never bundled.
    pub external: Vec<String>,

    /// Output directory for bundles and the import map, relative to `root`.
    pub out_dir: PathBuf,

    /// Upper bound on a single resource build or package bundle.
    pub build_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            cache: true,
            compression: Compression::default(),
            extensions: [".mjs", ".js", ".jsx", ".ts", ".tsx", ".json"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            external: Vec::new(),
            out_dir: PathBuf::from(".modserve"),
            build_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    /// Create a config rooted at `root` with every other field defaulted.
    ///
    /// An existing root is canonicalized so resolved files (which follow
    /// symlinks) stay comparable with it.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self {
            root: canonical_root(root),
            ..Default::default()
        }
    }

    /// Load `modserve.config.json` from `root` if present.
    ///
    /// The `root` field of the file, when given, is interpreted relative to
    /// the directory holding the file.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::new(root.to_path_buf()));
        }

        let content = std::fs::read_to_string(&path).map_err(|e| ServeError::ConfigRead {
            path: path.clone(),
            source: Arc::new(e),
        })?;
        let parse_err = |e| ServeError::ConfigParse {
            path: path.clone(),
            source: Arc::new(e),
        };
        let value: serde_json::Value = serde_json::from_str(&content).map_err(parse_err)?;
        let explicit_root = value
            .get("root")
            .and_then(|r| r.as_str())
            .map(PathBuf::from);
        let mut config: Self = serde_json::from_value(value).map_err(parse_err)?;

        config.root = canonical_root(match explicit_root {
            Some(r) if !r.as_os_str().is_empty() => root.join(r),
            _ => root.to_path_buf(),
        });
        Ok(config)
    }

    #[must_use]
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_external(mut self, external: Vec<String>) -> Self {
        self.external = external;
        self
    }

    #[must_use]
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Absolute output directory.
    #[must_use]
    pub fn out_dir(&self) -> PathBuf {
        self.root.join(&self.out_dir)
    }

    /// Directory holding bundled packages, served under `/web_modules/`.
    #[must_use]
    pub fn web_modules_dir(&self) -> PathBuf {
        self.out_dir().join("web_modules")
    }

    /// Location of the persisted import map.
    #[must_use]
    pub fn import_map_path(&self) -> PathBuf {
        self.out_dir().join("import-map.json")
    }

    #[must_use]
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    /// Whether a file is served as a script module.
    #[must_use]
    pub fn is_script(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let lower = name.to_ascii_lowercase();
        self.extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
    }

    /// Whether a package is on the never-bundle list.
    #[must_use]
    pub fn is_external(&self, package: &str) -> bool {
        self.external.iter().any(|p| p == package)
    }
}

fn canonical_root(root: PathBuf) -> PathBuf {
    dunce::canonicalize(&root).unwrap_or(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(PathBuf::from("/project"));
        assert!(config.cache);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.build_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.import_map_path(),
            PathBuf::from("/project/.modserve/import-map.json")
        );
        assert_eq!(
            config.web_modules_dir(),
            PathBuf::from("/project/.modserve/web_modules")
        );
    }

    #[test]
    fn test_is_script() {
        let config = ServerConfig::new(PathBuf::from("/project"));
        assert!(config.is_script(Path::new("/project/src/main.js")));
        assert!(config.is_script(Path::new("/project/src/App.TSX")));
        assert!(!config.is_script(Path::new("/project/src/style.css")));
        assert!(!config.is_script(Path::new("/project/src")));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::load(dir.path()).unwrap();
        assert_eq!(config.root, dir.path());
        assert!(config.cache);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"cache": false, "compression": "gzip", "external": ["react"], "buildTimeoutMs": 500}"#,
        )
        .unwrap();

        let config = ServerConfig::load(dir.path()).unwrap();
        assert!(!config.cache);
        assert_eq!(config.compression, Compression::Gzip);
        assert!(config.is_external("react"));
        assert_eq!(config.build_timeout_ms, 500);
        assert_eq!(config.root, dir.path());
        assert_eq!(config.out_dir, PathBuf::from(".modserve"));
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();

        let err = ServerConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ServeError::ConfigParse { .. }));
    }
}
