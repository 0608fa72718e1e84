use super::{TransformInput, TransformOutput, Transformer};
use crate::error::{Result, ServeError};
use crate::paths::{normalize_path, wants_module};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Stylesheets: local `@import` partials are inlined (and reported as
/// included files), and `?type=module` requests get the sheet wrapped as a
/// script that injects it.
#[derive(Debug, Default, Clone, Copy)]
pub struct StyleTransformer;

#[async_trait]
impl Transformer for StyleTransformer {
    async fn transform(&self, input: &TransformInput) -> Result<Option<TransformOutput>> {
        let is_css = input
            .filename
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("css"));
        if !is_css {
            return Ok(None);
        }

        let source = String::from_utf8_lossy(&input.content);
        let mut visited = HashSet::from([normalize_path(&input.filename)]);
        let mut included = Vec::new();
        let css = inline_imports(&source, &input.filename, &mut visited, &mut included)?;

        let (content, content_type) = if wants_module(input.query.as_deref()) {
            (
                create_css_module(&css),
                "application/javascript; charset=utf-8",
            )
        } else {
            (css, "text/css; charset=utf-8")
        };

        Ok(Some(TransformOutput {
            content: Bytes::from(content),
            content_type: content_type.to_string(),
            included_files: included,
            ..Default::default()
        }))
    }
}

/// Replace `@import "./x.css";` lines with the partial's content.
///
/// Remote and bare imports are left for the browser. A partial already on
/// the include path is skipped.
fn inline_imports(
    css: &str,
    file: &Path,
    visited: &mut HashSet<PathBuf>,
    included: &mut Vec<PathBuf>,
) -> Result<String> {
    let dir = file.parent().unwrap_or(Path::new("."));
    let mut out = String::with_capacity(css.len());

    for line in css.lines() {
        let Some(target) = local_import_target(line) else {
            out.push_str(line);
            out.push('\n');
            continue;
        };

        let partial = normalize_path(&dir.join(target));
        if !visited.insert(partial.clone()) {
            continue;
        }
        let content = std::fs::read_to_string(&partial).map_err(|e| ServeError::Transform {
            filename: file.to_path_buf(),
            message: format!("cannot read @import '{target}': {e}"),
        })?;
        included.push(partial.clone());
        out.push_str(&inline_imports(&content, &partial, visited, included)?);
    }
    Ok(out)
}

/// Target of a relative `@import` line, if the whole line is one.
fn local_import_target(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix("@import")?.trim();
    let rest = rest.strip_prefix("url(").unwrap_or(rest);
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = &rest[1..];
    let target = &inner[..inner.find(quote)?];
    (target.starts_with("./") || target.starts_with("../")).then_some(target)
}

/// Wrap CSS as an ES module that injects it into the document.
fn create_css_module(css: &str) -> String {
    let literal = serde_json::Value::String(css.to_string()).to_string();
    format!(
        r"const css = {literal};
const style = document.createElement('style');
style.setAttribute('data-modserve-css', '');
style.textContent = css;
document.head.appendChild(style);
export default css;
"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn input(filename: &Path, content: &str, query: Option<&str>) -> TransformInput {
        TransformInput {
            filename: filename.to_path_buf(),
            content: Bytes::from(content.to_string()),
            content_type: "text/css; charset=utf-8".to_string(),
            query: query.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_inlines_partials_and_reports_them() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("partials")).unwrap();
        std::fs::write(root.join("partials/colors.css"), "@import './base.css';\n.c { color: red; }").unwrap();
        std::fs::write(root.join("partials/base.css"), "* { margin: 0; }").unwrap();
        let main = root.join("main.css");
        let source = "@import url('./partials/colors.css');\n@import 'https://fonts.example.com/f.css';\nbody {}";

        let output = StyleTransformer
            .transform(&input(&main, source, None))
            .await
            .unwrap()
            .unwrap();
        let css = String::from_utf8(output.content.to_vec()).unwrap();

        assert_eq!(
            css,
            "* { margin: 0; }\n.c { color: red; }\n@import 'https://fonts.example.com/f.css';\nbody {}\n"
        );
        assert_eq!(
            output.included_files,
            vec![root.join("partials/colors.css"), root.join("partials/base.css")]
        );
        assert!(output.content_type.starts_with("text/css"));
    }

    #[tokio::test]
    async fn test_module_query_wraps_as_script() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("a.css");
        let output = StyleTransformer
            .transform(&input(&main, "a { content: \"`${x}`\"; }", Some("type=module")))
            .await
            .unwrap()
            .unwrap();
        let code = String::from_utf8(output.content.to_vec()).unwrap();

        assert!(output.content_type.starts_with("application/javascript"));
        assert!(code.starts_with("const css = \"a { content: \\\"`${x}`\\\"; }\\n\";"));
        assert!(code.contains("export default css;"));
    }

    #[tokio::test]
    async fn test_missing_partial_names_importer() {
        let dir = tempdir().unwrap();
        let main = dir.path().join("a.css");
        let err = StyleTransformer
            .transform(&input(&main, "@import './nope.css';", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ServeError::Transform { filename, .. } if filename == main));
    }

    #[tokio::test]
    async fn test_ignores_other_files() {
        let out = StyleTransformer
            .transform(&input(Path::new("/x/a.js"), "", None))
            .await
            .unwrap();
        assert!(out.is_none());
    }
}
