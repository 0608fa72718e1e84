//! CommonJS to ES module export proxies.
//!
//! A CommonJS module cannot be imported by name from an ES module, so each
//! CommonJS package entry is wrapped in a small generated module that
//! re-exports the names it is known to define:
//!
//! ```js
//! export { default } from "/abs/node_modules/pkg/index.js";
//! export { foo, bar } from "/abs/node_modules/pkg/index.js";
//! ```
//!
//! Names come from the static scan in [`lexer`]. Running the module through
//! an [`ExportReflector`] is a separate fallback, used only when the scan
//! finds no names at all.

pub mod lexer;
pub mod reflect;

pub use lexer::{parse_cjs_exports, CjsExports};
pub use reflect::{ExportReflector, NodeReflector};

use crate::error::{Result, ServeError};
use crate::paths::normalize_path;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Interop marker set by transpilers; never a real export.
const ES_MODULE_MARKER: &str = "__esModule";

/// How the exported names of a proxy were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStrategy {
    /// Static scan of the source and its relative re-exports.
    Static,
    /// Names read by executing the module.
    Reflected,
    /// Nothing found; only the default export is forwarded.
    DefaultOnly,
}

/// A generated ES module re-exporting a CommonJS module.
#[derive(Debug, Clone)]
pub struct ExportProxy {
    pub code: String,
    /// Modules the proxy imports. Always just the original file.
    pub imports: Vec<PathBuf>,
    /// Re-exported names, in discovery order.
    pub names: Vec<String>,
    pub strategy: ExportStrategy,
}

/// Build an export proxy for a CommonJS entry file.
///
/// `reflector` is consulted only when the static scan yields no names; if
/// it is absent or fails, the proxy forwards just the default export.
pub async fn generate_proxy(
    entry: &Path,
    reflector: Option<&dyn ExportReflector>,
) -> Result<ExportProxy> {
    let mut names = collect_static_exports(entry)?;
    let mut strategy = ExportStrategy::Static;

    if names.is_empty() {
        strategy = ExportStrategy::DefaultOnly;
        match reflector {
            Some(reflector) => match reflector.reflect(entry).await {
                Ok(keys) => {
                    names = usable_names(keys.iter().map(String::as_str))
                        .into_iter()
                        .filter(|n| n != "default")
                        .collect();
                    strategy = ExportStrategy::Reflected;
                }
                Err(e) => {
                    warn!(entry = %entry.display(), error = %e, "export reflection failed, forwarding default only");
                }
            },
            None => {
                warn!(entry = %entry.display(), "no static exports found and no reflector, forwarding default only");
            }
        }
    }

    let code = render_proxy(entry, &names);
    Ok(ExportProxy {
        code,
        imports: vec![entry.to_path_buf()],
        names,
        strategy,
    })
}

/// Statically discovered export names of `entry` and every file it
/// re-exports through relative `require` calls.
pub fn collect_static_exports(entry: &Path) -> Result<Vec<String>> {
    let mut visited = HashSet::new();
    let mut raw = Vec::new();
    visit(entry, true, &mut visited, &mut raw)?;
    Ok(usable_names(raw.iter().map(String::as_str)))
}

fn visit(
    file: &Path,
    is_entry: bool,
    visited: &mut HashSet<PathBuf>,
    names: &mut Vec<String>,
) -> Result<()> {
    let file = normalize_path(file);
    if !visited.insert(file.clone()) {
        return Ok(());
    }

    let source = match std::fs::read_to_string(&file) {
        Ok(source) => source,
        Err(e) if is_entry => return Err(ServeError::io(&file, e)),
        Err(e) => {
            debug!(file = %file.display(), error = %e, "skipping unreadable re-export");
            return Ok(());
        }
    };

    let found = parse_cjs_exports(&source);
    for name in found.names {
        if !names.contains(&name) {
            names.push(name);
        }
    }

    let dir = file.parent().unwrap_or(Path::new("."));
    for specifier in &found.reexports {
        if !(specifier.starts_with("./") || specifier.starts_with("../")) {
            continue;
        }
        match probe_relative(dir, specifier) {
            Some(target) => visit(&target, false, visited, names)?,
            None => debug!(specifier = %specifier, from = %file.display(), "re-export target not found"),
        }
    }
    Ok(())
}

/// Locate a relative `require` target: as written, then `.js`, then `/index.js`.
fn probe_relative(dir: &Path, specifier: &str) -> Option<PathBuf> {
    let base = normalize_path(&dir.join(specifier));
    if base.is_file() {
        return Some(base);
    }
    let with_ext = PathBuf::from(format!("{}.js", base.display()));
    if with_ext.is_file() {
        return Some(with_ext);
    }
    let index = base.join("index.js");
    index.is_file().then_some(index)
}

/// Drop the interop marker and anything that is not an identifier.
fn usable_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        if name == ES_MODULE_MARKER || !is_identifier(name) {
            continue;
        }
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn render_proxy(entry: &Path, names: &[String]) -> String {
    let file = entry.to_string_lossy().replace('\\', "/");
    // JSON string syntax is a valid JS string literal.
    let quoted = serde_json::Value::String(file).to_string();

    let mut code = String::new();
    if !names.iter().any(|n| n == "default") {
        code.push_str(&format!("export {{ default }} from {quoted};\n"));
    }
    if !names.is_empty() {
        code.push_str(&format!("export {{ {} }} from {quoted};\n", names.join(", ")));
    }
    code
}
