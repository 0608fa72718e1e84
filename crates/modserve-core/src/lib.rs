#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Core of the modserve development module server.
//!
//! Everything here is independent of the HTTP layer:
//! - configuration and the error type
//! - URL and path helpers
//! - import scanning and rewriting
//! - CommonJS export proxies
//! - module resolution with lazy package bundling
//! - the transformer pipeline

pub mod cjs;
pub mod config;
pub mod error;
pub mod imports;
pub mod lexer;
pub mod modules;
pub mod paths;
pub mod transform;

pub use cjs::{generate_proxy, ExportProxy, ExportReflector, ExportStrategy, NodeReflector};
pub use config::{Compression, ServerConfig};
pub use error::{Result, ServeError};
pub use imports::{rewrite_imports, scan_imports, ImportKind, ImportSpan};
pub use modules::{
    BuildInput, BuildOutput, BuildRequest, Bundler, ImportMap, ModuleResolver,
    ModuleResolverBuilder, NodePathResolver, PathResolver, ResolveHook, ResolvedId, WebModule,
    WorkspaceTable,
};
pub use transform::{
    ScriptTransformer, StyleTransformer, TransformInput, TransformOutput, TransformPipeline,
    Transformer,
};
