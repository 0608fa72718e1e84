//! Interface to the package bundler.
//!
//! The bundler itself is supplied by the embedding application. The module
//! resolver hands it one entry at a time, together with a [`ResolveHook`]
//! that decides which imports stay external.

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// What to bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildInput {
    /// An ES module entry file.
    Entry(PathBuf),
    /// Generated source (a CommonJS export proxy). Imports are resolved
    /// relative to `resolve_dir`.
    Inline { source: String, resolve_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub input: BuildInput,
    /// Where the single-file ES module bundle must be written.
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub output_file: PathBuf,
    /// Specifiers left as imports in the bundle.
    pub externals: Vec<String>,
}

/// Outcome of a hook resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedId {
    /// Specifier to emit (for externals) or path to load.
    pub id: String,
    pub external: bool,
}

impl ResolvedId {
    #[must_use]
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external: true,
        }
    }
}

/// Resolution callback consulted for every import the bundler meets.
#[async_trait]
pub trait ResolveHook: Send + Sync {
    /// `Ok(None)` lets the bundler resolve and inline the import itself.
    async fn resolve(&self, specifier: &str, importer: Option<&Path>) -> Result<Option<ResolvedId>>;
}

/// Produces single-file ES module bundles.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn build(&self, request: BuildRequest, hook: &dyn ResolveHook) -> Result<BuildOutput>;
}
