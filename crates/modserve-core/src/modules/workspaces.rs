//! Locally developed packages.
//!
//! Parses the `workspaces` field from the root package.json and discovers
//! workspace packages. Supports glob patterns like `packages/*`. The table is
//! built once at startup and never changes afterwards.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A discovered workspace package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePackage {
    /// Package name from package.json
    pub name: String,
    /// Absolute path to the package directory
    pub dir: PathBuf,
    /// Local entry file (`module`, then `main`, then `index.js`), if present
    pub entry: Option<PathBuf>,
}

/// Workspace packages by name.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceTable {
    packages: HashMap<String, WorkspacePackage>,
}

impl WorkspaceTable {
    /// Discover the workspace packages declared by `root/package.json`.
    ///
    /// A project without workspaces yields an empty table.
    #[must_use]
    pub fn discover(root: &Path) -> Self {
        let Some(patterns) = workspace_patterns(root) else {
            return Self::default();
        };

        let mut packages = HashMap::new();
        for pattern in &patterns {
            let full_pattern = root.join(pattern);
            let pattern_str = full_pattern.to_string_lossy();
            if let Ok(entries) = glob::glob(&pattern_str) {
                for entry in entries.flatten() {
                    if let Some(pkg) = read_workspace_package(&entry) {
                        packages.insert(pkg.name.clone(), pkg);
                    }
                }
            }
        }
        Self { packages }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&WorkspacePackage> {
        self.packages.get(name)
    }

    /// The workspace package whose directory holds `file`.
    #[must_use]
    pub fn owner_of(&self, file: &Path) -> Option<&WorkspacePackage> {
        self.packages
            .values()
            .filter(|p| file.starts_with(&p.dir))
            .max_by_key(|p| p.dir.components().count())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Glob patterns from the root manifest's `workspaces` field.
///
/// Workspaces can be an array or an object with a `packages` field (yarn).
fn workspace_patterns(root: &Path) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(root.join("package.json")).ok()?;
    let package: Value = serde_json::from_str(&content).ok()?;

    let list = match package.get("workspaces")? {
        Value::Array(arr) => arr,
        Value::Object(obj) => obj.get("packages")?.as_array()?,
        _ => return None,
    };
    Some(
        list.iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
    )
}

fn read_workspace_package(dir: &Path) -> Option<WorkspacePackage> {
    if !dir.is_dir() {
        return None;
    }

    let content = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let package: Value = serde_json::from_str(&content).ok()?;
    let name = package.get("name")?.as_str()?.to_string();

    let dir = dunce::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let entry = ["module", "main"]
        .iter()
        .filter_map(|field| package.get(*field).and_then(Value::as_str))
        .map(|rel| dir.join(rel))
        .chain(std::iter::once(dir.join("index.js")))
        .find(|p| p.is_file());

    Some(WorkspacePackage { name, dir, entry })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_discover_array_format() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join("package.json"),
            r#"{"name": "monorepo", "workspaces": ["packages/*"]}"#,
        )
        .unwrap();

        let pkg_dir = root.path().join("packages").join("my-lib");
        fs::create_dir_all(pkg_dir.join("src")).unwrap();
        fs::write(
            pkg_dir.join("package.json"),
            r#"{"name": "@myorg/my-lib", "module": "src/index.js"}"#,
        )
        .unwrap();
        fs::write(pkg_dir.join("src/index.js"), "export const x = 1;").unwrap();

        let table = WorkspaceTable::discover(root.path());
        assert!(table.contains("@myorg/my-lib"));
        assert_eq!(table.len(), 1);

        let pkg = table.get("@myorg/my-lib").unwrap();
        assert!(pkg.entry.as_ref().unwrap().ends_with("src/index.js"));
        assert_eq!(
            table.owner_of(pkg.entry.as_ref().unwrap()).map(|p| p.name.as_str()),
            Some("@myorg/my-lib")
        );
    }

    #[test]
    fn test_discover_object_format() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join("package.json"),
            r#"{"name": "monorepo", "workspaces": {"packages": ["packages/*"]}}"#,
        )
        .unwrap();

        let pkg_dir = root.path().join("packages").join("utils");
        fs::create_dir_all(&pkg_dir).unwrap();
        fs::write(pkg_dir.join("package.json"), r#"{"name": "utils"}"#).unwrap();

        let table = WorkspaceTable::discover(root.path());
        assert!(table.contains("utils"));
        assert!(table.get("utils").unwrap().entry.is_none());
    }

    #[test]
    fn test_no_workspaces() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join("package.json"),
            r#"{"name": "regular-project"}"#,
        )
        .unwrap();

        assert!(WorkspaceTable::discover(root.path()).is_empty());
    }
}
