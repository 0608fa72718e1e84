//! Path and URL helpers shared by the resolver and the resource cache.
//!
//! URLs handed out by the server come in three namespaces:
//! - `/web_modules/<pkg>/<path>`: bundled packages, stored under the output directory
//! - `/node_modules/<pkg>/<path>`: raw passthrough of installed files
//! - `/<path>`: workspace files, relative to the root

use crate::config::ServerConfig;
use crate::error::{Result, ServeError};
use std::path::{Component, Path, PathBuf};

/// URL prefix of bundled packages.
pub const WEB_MODULES_PREFIX: &str = "/web_modules/";

/// Query marker asking for a non-script asset wrapped as an ES module.
pub const MODULE_QUERY: &str = "type=module";

/// Split a request URL into its pathname and optional query string.
#[must_use]
pub fn split_url(url: &str) -> (&str, Option<&str>) {
    let url = url.split('#').next().unwrap_or(url);
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query).filter(|q| !q.is_empty())),
        None => (url, None),
    }
}

/// Whether a URL query asks for `type=module` wrapping.
#[must_use]
pub fn wants_module(query: Option<&str>) -> bool {
    query.is_some_and(|q| q.split('&').any(|pair| pair == MODULE_QUERY))
}

/// Append a query parameter to a URL.
#[must_use]
pub fn with_query(url: &str, param: &str) -> String {
    if url.contains('?') {
        format!("{url}&{param}")
    } else {
        format!("{url}?{param}")
    }
}

/// Check if a specifier points at the network rather than the workspace.
#[must_use]
pub fn has_network_scheme(specifier: &str) -> bool {
    specifier.starts_with("//")
        || ["http:", "https:", "data:", "blob:"]
            .iter()
            .any(|scheme| specifier.starts_with(scheme))
}

/// Check if a specifier is a bare import (not relative, not absolute).
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.is_empty()
        && !specifier.starts_with('/')
        && !specifier.starts_with("./")
        && !specifier.starts_with("../")
        && specifier != "."
        && specifier != ".."
        && !has_network_scheme(specifier)
}

/// Split a bare specifier into package name and subpath.
///
/// Handles scoped packages: `@babel/core/lib/parse` → (`@babel/core`, `lib/parse`).
#[must_use]
pub fn split_package_specifier(specifier: &str) -> (String, Option<String>) {
    if specifier.starts_with('@') {
        let parts: Vec<&str> = specifier.splitn(3, '/').collect();
        if parts.len() >= 2 {
            let pkg = format!("{}/{}", parts[0], parts[1]);
            let subpath = parts
                .get(2)
                .filter(|s| !s.is_empty())
                .map(|s| (*s).to_string());
            (pkg, subpath)
        } else {
            (specifier.to_string(), None)
        }
    } else {
        match specifier.split_once('/') {
            Some((pkg, sub)) if !sub.is_empty() => (pkg.to_string(), Some(sub.to_string())),
            Some((pkg, _)) => (pkg.to_string(), None),
            None => (specifier.to_string(), None),
        }
    }
}

/// Package name of a bare specifier.
#[must_use]
pub fn package_name(specifier: &str) -> String {
    split_package_specifier(specifier).0
}

/// Collapse `.` and `..` components without touching the file system.
///
/// `..` above the root of a relative path is kept, so the result never
/// silently drops a component it cannot resolve.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Root-relative filename with `/` separators, or `None` outside the root.
///
/// This is the key used by the watch bridge.
#[must_use]
pub fn relative_filename(root: &Path, file: &Path) -> Option<String> {
    let file = normalize_path(file);
    let root = normalize_path(root);
    let rel = file.strip_prefix(&root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Root-relative URL path (`/src/App.js`) for a file inside the workspace.
#[must_use]
pub fn to_url_path(root: &Path, file: &Path) -> Option<String> {
    relative_filename(root, file).map(|rel| format!("/{rel}"))
}

/// File name a script gets once bundled: every script becomes `.js`.
#[must_use]
pub fn bundled_file_name(path: &str) -> String {
    for ext in [".mjs", ".cjs", ".jsx", ".tsx", ".mts", ".cts", ".ts"] {
        if let Some(stem) = path.strip_suffix(ext) {
            return format!("{stem}.js");
        }
    }
    if path.ends_with(".js") {
        path.to_string()
    } else {
        format!("{path}.js")
    }
}

/// Content type served for a file, by extension.
#[must_use]
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "js" | "mjs" | "cjs" | "jsx" | "ts" | "tsx" | "mts" | "cts" => {
            "application/javascript; charset=utf-8"
        }
        "json" | "map" => "application/json; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" | "md" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Map a request pathname to the file that backs it.
///
/// - `/web_modules/*` maps into the bundle output directory
/// - a directory without trailing slash redirects to the slashed URL
/// - a directory with trailing slash serves its `index.html`
/// - the legacy `/favicon.ico` redirects to `/favicon.svg` when only that exists
/// - paths escaping the root are not found
pub fn locate_file(config: &ServerConfig, pathname: &str) -> Result<PathBuf> {
    let decoded = percent_decode(pathname);
    let relative = decoded.trim_start_matches('/');

    let (base, rest) = match decoded.strip_prefix(WEB_MODULES_PREFIX) {
        Some(rest) => (config.web_modules_dir(), rest.to_string()),
        None => (config.root.clone(), relative.to_string()),
    };

    let candidate = normalize_path(&base.join(&rest));
    if !candidate.starts_with(normalize_path(&base)) {
        return Err(ServeError::not_found(pathname));
    }

    if candidate.is_dir() {
        if !pathname.ends_with('/') {
            return Err(ServeError::Redirect {
                location: format!("{pathname}/"),
            });
        }
        let index = candidate.join("index.html");
        if index.is_file() {
            return Ok(index);
        }
        return Err(ServeError::not_found(pathname));
    }

    if candidate.is_file() {
        return Ok(candidate);
    }

    if pathname == "/favicon.ico" && config.root.join("favicon.svg").is_file() {
        return Err(ServeError::Redirect {
            location: "/favicon.svg".to_string(),
        });
    }

    Err(ServeError::not_found(pathname))
}

/// Decode `%XX` escapes in a URL path. Malformed escapes are kept verbatim.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
