use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Error type for resource serving, module resolution and bundling.
///
/// `Clone` so that one failed in-flight computation can hand the same error
/// to every requester attached to it.
#[derive(Error, Debug, Clone)]
pub enum ServeError {
    #[error("Not found: {path}")]
    NotFound { path: String },

    #[error("Redirect to {location}")]
    Redirect { location: String },

    #[error("Cannot resolve '{specifier}' from '{importer}': {message}")]
    Resolve {
        specifier: String,
        importer: String,
        message: String,
    },

    #[error("Failed to transform {}: {message}", filename.display())]
    Transform { filename: PathBuf, message: String },

    #[error("Failed to bundle '{id}': {message}")]
    Bundle { id: String, message: String },

    #[error("Build of '{key}' timed out after {millis}ms")]
    Timeout { key: String, millis: u64 },

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Failed to read config at {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Failed to parse config at {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("Watcher failed: {0}")]
    Watch(String),
}

impl ServeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn resolve(
        specifier: impl Into<String>,
        importer: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Resolve {
            specifier: specifier.into(),
            importer: importer.into(),
            message: message.into(),
        }
    }

    pub fn bundle(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Bundle {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Annotate an arbitrary failure with the file being transformed.
    ///
    /// Errors that already name a file are passed through untouched.
    #[must_use]
    pub fn in_file(self, filename: &std::path::Path) -> Self {
        match self {
            Self::Transform { .. } | Self::NotFound { .. } | Self::Redirect { .. } => self,
            other => Self::Transform {
                filename: filename.to_path_buf(),
                message: other.to_string(),
            },
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T, E = ServeError> = std::result::Result<T, E>;
