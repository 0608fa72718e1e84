//! Import specifier → file resolution.
//!
//! ## Specifier Types
//!
//! - Relative: `./utils`, `../lib/foo` (against the base directory)
//! - Root-relative: `/src/App.js` (against the workspace root, as in a URL)
//! - Bare: `lodash`, `@scope/pkg`, `lodash/get` (through `node_modules`)

use crate::error::{Result, ServeError};
use crate::paths::split_package_specifier;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Maps an import specifier to an absolute file.
#[async_trait]
pub trait PathResolver: Send + Sync {
    /// Resolve `specifier` as imported from a file in `basedir`.
    ///
    /// Returns [`ServeError::NotFound`] when nothing matches.
    async fn resolve(&self, specifier: &str, basedir: &Path) -> Result<PathBuf>;
}

/// Export conditions, in preference order.
const CONDITIONS: &[&str] = &["browser", "import", "default", "require"];

/// Node-style resolver: package `exports`, `module`, `main`, extension and
/// `index` probing, walking `node_modules` upward.
#[derive(Debug, Clone)]
pub struct NodePathResolver {
    root: PathBuf,
    extensions: Vec<String>,
}

impl NodePathResolver {
    #[must_use]
    pub fn new(root: PathBuf, extensions: Vec<String>) -> Self {
        Self { root, extensions }
    }

    /// Resolve synchronously. Same contract as [`PathResolver::resolve`].
    pub fn resolve_sync(&self, specifier: &str, basedir: &Path) -> Result<PathBuf> {
        let found = if specifier.starts_with("./") || specifier.starts_with("../") {
            self.resolve_file_or_directory(&basedir.join(specifier))
        } else if let Some(rooted) = specifier.strip_prefix('/') {
            self.resolve_file_or_directory(&self.root.join(rooted))
        } else {
            self.resolve_bare(specifier, basedir)
        };

        let found = found.ok_or_else(|| ServeError::not_found(specifier))?;
        dunce::canonicalize(&found).map_err(|e| ServeError::io(found, e))
    }

    /// Walk up from `basedir` looking for `node_modules/<pkg>`.
    fn resolve_bare(&self, specifier: &str, basedir: &Path) -> Option<PathBuf> {
        let (pkg_name, subpath) = split_package_specifier(specifier);

        let mut current = Some(basedir);
        while let Some(dir) = current {
            let pkg_dir = dir.join("node_modules").join(&pkg_name);
            if pkg_dir.is_dir() {
                if let Some(found) = self.resolve_in_package(&pkg_dir, subpath.as_deref()) {
                    return Some(found);
                }
            }
            current = dir.parent();
        }
        None
    }

    /// Resolve an entry or subpath inside a package directory.
    fn resolve_in_package(&self, pkg_dir: &Path, subpath: Option<&str>) -> Option<PathBuf> {
        let manifest = read_manifest(&pkg_dir.join("package.json"));

        if let Some(exports) = manifest.as_ref().and_then(|m| m.get("exports")) {
            let key = subpath.map_or_else(|| ".".to_string(), |s| format!("./{s}"));
            if let Some(target) = resolve_exports(exports, &key) {
                let file = pkg_dir.join(target.trim_start_matches("./"));
                if file.is_file() {
                    return Some(file);
                }
            }
        }

        if let Some(sub) = subpath {
            return self.resolve_file_or_directory(&pkg_dir.join(sub));
        }

        if let Some(manifest) = &manifest {
            for field in ["module", "main"] {
                if let Some(entry) = manifest.get(field).and_then(Value::as_str) {
                    if let Some(found) = self.resolve_file_or_directory(&pkg_dir.join(entry)) {
                        return Some(found);
                    }
                }
            }
        }

        self.resolve_index(pkg_dir)
    }

    /// A path that might be a file, an extensionless file, or a directory.
    fn resolve_file_or_directory(&self, target: &Path) -> Option<PathBuf> {
        if target.is_file() {
            return Some(target.to_path_buf());
        }

        for ext in &self.extensions {
            let with_ext = PathBuf::from(format!("{}{ext}", target.display()));
            if with_ext.is_file() {
                return Some(with_ext);
            }
        }

        if target.is_dir() {
            // A nested package.json may point at the directory's entry.
            if let Some(manifest) = read_manifest(&target.join("package.json")) {
                for field in ["module", "main"] {
                    if let Some(entry) = manifest.get(field).and_then(Value::as_str) {
                        let file = target.join(entry);
                        if file.is_file() {
                            return Some(file);
                        }
                    }
                }
            }
            return self.resolve_index(target);
        }

        None
    }

    fn resolve_index(&self, dir: &Path) -> Option<PathBuf> {
        self.extensions
            .iter()
            .map(|ext| dir.join(format!("index{ext}")))
            .find(|p| p.is_file())
    }
}

#[async_trait]
impl PathResolver for NodePathResolver {
    async fn resolve(&self, specifier: &str, basedir: &Path) -> Result<PathBuf> {
        self.resolve_sync(specifier, basedir)
    }
}

fn read_manifest(path: &Path) -> Option<Value> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Look up `subpath` (`.` or `./x`) in a package `exports` field.
fn resolve_exports(exports: &Value, subpath: &str) -> Option<String> {
    match exports {
        Value::String(s) if subpath == "." => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|v| resolve_exports(v, subpath)),
        Value::Object(map) => {
            let is_subpath_map = map.keys().any(|k| k.starts_with('.'));
            if !is_subpath_map {
                // Conditions apply to the package root only.
                return if subpath == "." {
                    resolve_export_value(exports)
                } else {
                    None
                };
            }

            if let Some(value) = map.get(subpath) {
                return resolve_export_value(value);
            }

            // "./lib/*": "./dist/lib/*.js"
            map.iter().find_map(|(key, value)| {
                let (prefix, suffix) = key.split_once('*')?;
                let matched = subpath.strip_prefix(prefix)?.strip_suffix(suffix)?;
                resolve_export_value(value).map(|t| t.replace('*', matched))
            })
        }
        _ => None,
    }
}

/// Resolve a single export target through its conditions.
fn resolve_export_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(resolve_export_value),
        Value::Object(map) => CONDITIONS
            .iter()
            .filter_map(|c| map.get(*c))
            .find_map(resolve_export_value),
        _ => None,
    }
}

/// The nearest `package.json` above `file`, with its directory.
#[must_use]
pub fn nearest_manifest(file: &Path) -> Option<(PathBuf, Value)> {
    let mut current = file.parent();
    while let Some(dir) = current {
        if let Some(manifest) = read_manifest(&dir.join("package.json")) {
            return Some((dir.to_path_buf(), manifest));
        }
        if dir.file_name().is_some_and(|n| n == "node_modules") {
            return None;
        }
        current = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn resolver(root: &Path) -> NodePathResolver {
        NodePathResolver::new(
            root.to_path_buf(),
            vec![".mjs".into(), ".js".into(), ".ts".into()],
        )
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_resolve_relative_with_extension_probe() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        write(&root.join("src/index.ts"), "import './utils';");
        write(&root.join("src/utils.ts"), "export const x = 1;");

        let found = resolver(&root)
            .resolve_sync("./utils", &root.join("src"))
            .unwrap();
        assert_eq!(found, root.join("src/utils.ts"));
    }

    #[test]
    fn test_resolve_root_relative() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        write(&root.join("src/lib/index.js"), "");

        let found = resolver(&root)
            .resolve_sync("/src/lib", &root.join("elsewhere"))
            .unwrap();
        assert_eq!(found, root.join("src/lib/index.js"));
    }

    #[test]
    fn test_resolve_bare_main_and_subpath() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let pkg = root.join("node_modules/lodash");
        write(&pkg.join("package.json"), r#"{"name":"lodash","main":"lodash.js"}"#);
        write(&pkg.join("lodash.js"), "module.exports = {};");
        write(&pkg.join("get.js"), "module.exports = function get() {};");

        let r = resolver(&root);
        assert_eq!(
            r.resolve_sync("lodash", &root.join("src")).unwrap(),
            pkg.join("lodash.js")
        );
        assert_eq!(
            r.resolve_sync("lodash/get", &root.join("src")).unwrap(),
            pkg.join("get.js")
        );
    }

    #[test]
    fn test_resolve_exports_conditions() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let pkg = root.join("node_modules/@scope/ui");
        write(
            &pkg.join("package.json"),
            r#"{
                "name": "@scope/ui",
                "main": "cjs/index.js",
                "exports": {
                    ".": { "require": "./cjs/index.js", "import": "./esm/index.mjs" },
                    "./icons/*": { "default": "./esm/icons/*.mjs" }
                }
            }"#,
        );
        write(&pkg.join("cjs/index.js"), "");
        write(&pkg.join("esm/index.mjs"), "");
        write(&pkg.join("esm/icons/star.mjs"), "");

        let r = resolver(&root);
        assert_eq!(
            r.resolve_sync("@scope/ui", &root).unwrap(),
            pkg.join("esm/index.mjs")
        );
        assert_eq!(
            r.resolve_sync("@scope/ui/icons/star", &root).unwrap(),
            pkg.join("esm/icons/star.mjs")
        );
    }

    #[test]
    fn test_resolve_walks_up_node_modules() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        write(&root.join("node_modules/dep/index.js"), "");

        let found = resolver(&root)
            .resolve_sync("dep", &root.join("packages/app/src"))
            .unwrap();
        assert_eq!(found, root.join("node_modules/dep/index.js"));
    }

    #[test]
    fn test_not_found() {
        let dir = tempdir().unwrap();
        let err = resolver(dir.path())
            .resolve_sync("missing-pkg", dir.path())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_nearest_manifest() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("node_modules/esm-only");
        write(&pkg.join("package.json"), r#"{"type":"module"}"#);
        write(&pkg.join("lib/index.js"), "");

        let (found_dir, manifest) = nearest_manifest(&pkg.join("lib/index.js")).unwrap();
        assert_eq!(found_dir, pkg);
        assert_eq!(manifest["type"], "module");
    }
}
