//! Module resolution and lazy package bundling.
//!
//! [`ModuleResolver::resolve_import`] turns an import specifier found in a
//! served file into the URL the browser should fetch. Bare package imports
//! are bundled on first use through the pluggable [`Bundler`] and recorded in
//! the persisted [`ImportMap`], so later requests (and later processes) reuse
//! the bundle.
//!
//! ## URL namespaces
//!
//! - `/web_modules/<pkg>/<path>`: a bundle produced here
//! - `/node_modules/<pkg>/<path>`: a raw installed file (pass-through packages
//!   and non-script assets)
//! - `/<path>`: a workspace file

pub mod bundler;
pub mod import_map;
pub mod path_resolver;
pub mod workspaces;

pub use bundler::{BuildInput, BuildOutput, BuildRequest, Bundler, ResolveHook, ResolvedId};
pub use import_map::ImportMap;
pub use path_resolver::{NodePathResolver, PathResolver};
pub use workspaces::{WorkspacePackage, WorkspaceTable};

use crate::cjs::{generate_proxy, ExportReflector};
use crate::config::ServerConfig;
use crate::error::{Result, ServeError};
use crate::imports::has_module_syntax;
use crate::paths::{
    bundled_file_name, has_network_scheme, is_bare_specifier, package_name,
    split_package_specifier, to_url_path, with_query, MODULE_QUERY, WEB_MODULES_PREFIX,
};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Terminal state of a bundling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebModule {
    /// Served from this bundle URL.
    Bundled(String),
    /// Served unbundled from its installed location.
    Passthrough,
}

type BundleFuture = BoxFuture<'static, Result<WebModule>>;

/// Ids currently being bundled, outermost first.
type Chain = Arc<Vec<String>>;

/// Resolves import specifiers to URLs, bundling packages on demand.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ModuleResolver {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ServerConfig>,
    paths: Arc<dyn PathResolver>,
    bundler: Arc<dyn Bundler>,
    reflector: Option<Arc<dyn ExportReflector>>,
    workspaces: WorkspaceTable,
    /// Lock order: `pending` before `import_map`.
    pending: Mutex<HashMap<String, Shared<BundleFuture>>>,
    import_map: Mutex<ImportMap>,
    /// Serialises writes of the persisted map.
    persist_lock: tokio::sync::Mutex<()>,
    bundles_built: AtomicUsize,
}

/// Builder for [`ModuleResolver`].
pub struct ModuleResolverBuilder {
    config: Arc<ServerConfig>,
    bundler: Arc<dyn Bundler>,
    paths: Option<Arc<dyn PathResolver>>,
    reflector: Option<Arc<dyn ExportReflector>>,
    workspaces: Option<WorkspaceTable>,
    import_map: Option<ImportMap>,
}

impl ModuleResolverBuilder {
    /// Replace the default [`NodePathResolver`].
    #[must_use]
    pub fn path_resolver(mut self, paths: Arc<dyn PathResolver>) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Enable the runtime fallback for CommonJS export discovery.
    #[must_use]
    pub fn reflector(mut self, reflector: Arc<dyn ExportReflector>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    /// Replace the workspace table discovered from the root manifest.
    #[must_use]
    pub fn workspaces(mut self, workspaces: WorkspaceTable) -> Self {
        self.workspaces = Some(workspaces);
        self
    }

    /// Start from this map instead of the persisted one.
    #[must_use]
    pub fn import_map(mut self, map: ImportMap) -> Self {
        self.import_map = Some(map);
        self
    }

    #[must_use]
    pub fn build(self) -> ModuleResolver {
        let config = self.config;
        let paths = self.paths.unwrap_or_else(|| {
            Arc::new(NodePathResolver::new(
                config.root.clone(),
                config.extensions.clone(),
            ))
        });
        let workspaces = self
            .workspaces
            .unwrap_or_else(|| WorkspaceTable::discover(&config.root));
        let import_map = self.import_map.unwrap_or_else(|| ImportMap::load(&config));
        debug!(
            workspaces = workspaces.len(),
            known = import_map.len(),
            "module resolver ready"
        );

        ModuleResolver {
            inner: Arc::new(Inner {
                config,
                paths,
                bundler: self.bundler,
                reflector: self.reflector,
                workspaces,
                pending: Mutex::new(HashMap::new()),
                import_map: Mutex::new(import_map),
                persist_lock: tokio::sync::Mutex::new(()),
                bundles_built: AtomicUsize::new(0),
            }),
        }
    }
}

impl ModuleResolver {
    #[must_use]
    pub fn builder(config: Arc<ServerConfig>, bundler: Arc<dyn Bundler>) -> ModuleResolverBuilder {
        ModuleResolverBuilder {
            config,
            bundler,
            paths: None,
            reflector: None,
            workspaces: None,
            import_map: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.inner.config
    }

    /// Resolve an import specifier to the URL serving it.
    ///
    /// `importer` is the absolute path of the importing file, if any.
    pub async fn resolve_import(&self, specifier: &str, importer: Option<&Path>) -> Result<String> {
        let inner = &self.inner;

        if has_network_scheme(specifier) {
            return Ok(specifier.to_string());
        }
        if let Some(url) = inner.lookup(specifier) {
            return Ok(url);
        }

        let bare = is_bare_specifier(specifier);
        let pkg = package_name(specifier);
        if bare {
            if !inner.knows(&pkg) {
                inner.bundle_task(&pkg, Chain::default()).await?;
            }
            if let Some(url) = inner.lookup(specifier) {
                return Ok(url);
            }
        }

        let basedir = importer
            .and_then(Path::parent)
            .map_or_else(|| inner.config.root.clone(), Path::to_path_buf);
        let file = inner
            .paths
            .resolve(specifier, &basedir)
            .await
            .map_err(|e| resolve_failure(specifier, importer, &e))?;
        let target_is_script = inner.config.is_script(&file);

        let bundled = if bare && target_is_script && !inner.is_passthrough(&pkg) {
            match inner.bundle_task(specifier, Chain::default()).await? {
                WebModule::Bundled(url) => Some(url),
                WebModule::Passthrough => None,
            }
        } else {
            None
        };
        let url = match bundled {
            Some(url) => url,
            None => to_url_path(&inner.config.root, &file).ok_or_else(|| {
                ServeError::resolve(
                    specifier,
                    importer_label(importer),
                    format!("{} is outside the workspace root", file.display()),
                )
            })?,
        };

        let importer_is_script = importer.map_or(true, |i| inner.config.is_script(i));
        if !target_is_script && importer_is_script {
            return Ok(with_query(&url, MODULE_QUERY));
        }
        Ok(url)
    }

    /// Bundle a package or package subpath, once.
    ///
    /// Concurrent calls for the same id share one build. Known ids return
    /// immediately.
    pub async fn bundle_web_module(&self, source_id: &str) -> Result<WebModule> {
        self.inner.bundle_task(source_id, Chain::default()).await
    }

    /// Snapshot of the import map.
    #[must_use]
    pub fn import_map(&self) -> ImportMap {
        self.inner.import_map.lock().unwrap().clone()
    }

    /// Number of bundler builds completed by this instance.
    #[must_use]
    pub fn bundles_built(&self) -> usize {
        self.inner.bundles_built.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn lookup(&self, key: &str) -> Option<String> {
        self.import_map.lock().unwrap().get(key).map(String::from)
    }

    fn knows(&self, id: &str) -> bool {
        self.import_map.lock().unwrap().knows(id)
    }

    fn is_passthrough(&self, id: &str) -> bool {
        self.import_map.lock().unwrap().is_passthrough(id)
    }

    fn known_state(&self, id: &str) -> Option<WebModule> {
        let map = self.import_map.lock().unwrap();
        if let Some(url) = map.get(id) {
            return Some(WebModule::Bundled(url.to_string()));
        }
        map.is_passthrough(id).then_some(WebModule::Passthrough)
    }

    /// The single in-flight bundle for `id`, creating it if needed.
    fn bundle_task(self: &Arc<Self>, id: &str, chain: Chain) -> BundleFuture {
        if let Some(known) = self.known_state(id) {
            return futures::future::ready(Ok(known)).boxed();
        }

        let mut pending = self.pending.lock().unwrap();
        // A task may have finished between the check above and this lock.
        if let Some(known) = self.known_state(id) {
            return futures::future::ready(Ok(known)).boxed();
        }
        if let Some(existing) = pending.get(id) {
            debug!(id = %id, "joining in-flight bundle");
            return existing.clone().boxed();
        }

        let inner = Arc::clone(self);
        let key = id.to_string();
        let timeout = self.config.build_timeout();
        let handle = tokio::spawn(async move {
            // Dropped last, also when the bundler panics. Success has
            // already been recorded in the import map by then.
            let _pending = PendingGuard {
                inner: Arc::clone(&inner),
                key: key.clone(),
            };
            match tokio::time::timeout(timeout, Arc::clone(&inner).run_bundle(key.clone(), chain))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ServeError::Timeout {
                    key: key.clone(),
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        });

        let key = id.to_string();
        let shared = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(ServeError::bundle(key, format!("bundle task failed: {e}"))))
        }
        .boxed()
        .shared();
        pending.insert(id.to_string(), shared.clone());
        shared.boxed()
    }

    async fn run_bundle(self: Arc<Self>, id: String, chain: Chain) -> Result<WebModule> {
        let pkg = package_name(&id);
        if self.config.is_external(&pkg) {
            debug!(id = %id, "external package, serving unbundled");
            return self.record_passthrough(&id).await;
        }

        let Some(entry) = self.find_entry(&id).await? else {
            info!(id = %id, "no entry file, serving unbundled");
            return self.record_passthrough(&id).await;
        };

        let web_path = self.web_path(&pkg, &entry);
        let output = self.config.web_modules_dir().join(&web_path);
        let mut entry_urls: Vec<String> = to_url_path(&self.config.root, &entry).into_iter().collect();

        let input = if is_commonjs(&entry) {
            let proxy = generate_proxy(&entry, self.reflector.as_deref()).await?;
            debug!(id = %id, names = proxy.names.len(), strategy = ?proxy.strategy, "generated export proxy");
            for file in &proxy.imports {
                if let Some(url) = to_url_path(&self.config.root, file) {
                    if !entry_urls.contains(&url) {
                        entry_urls.push(url);
                    }
                }
            }
            BuildInput::Inline {
                source: proxy.code,
                resolve_dir: entry.parent().map_or_else(|| self.config.root.clone(), Path::to_path_buf),
            }
        } else {
            BuildInput::Entry(entry.clone())
        };

        let mut next_chain: Vec<String> = chain.as_ref().clone();
        next_chain.push(id.clone());
        let hook = BundleHook {
            inner: Arc::clone(&self),
            chain: Arc::new(next_chain),
        };

        let built = self
            .bundler
            .build(BuildRequest { input, output }, &hook)
            .await
            .map_err(|e| match e {
                ServeError::Bundle { .. } | ServeError::Timeout { .. } => e,
                other => ServeError::bundle(&id, other.to_string()),
            })?;

        let url = self.web_url_for(&built.output_file).unwrap_or_else(|| {
            format!("{WEB_MODULES_PREFIX}{web_path}")
        });
        {
            let mut map = self.import_map.lock().unwrap();
            map.insert(id.clone(), url.clone());
            for entry_url in entry_urls {
                map.insert(entry_url, url.clone());
            }
        }
        self.persist().await?;
        self.bundles_built.fetch_add(1, Ordering::SeqCst);
        info!(id = %id, url = %url, externals = built.externals.len(), "bundled web module");
        Ok(WebModule::Bundled(url))
    }

    async fn record_passthrough(&self, id: &str) -> Result<WebModule> {
        self.import_map.lock().unwrap().mark_passthrough(id);
        self.persist().await?;
        Ok(WebModule::Passthrough)
    }

    /// Write the current map. Each write snapshots under the persist lock,
    /// so the last write always carries every earlier entry.
    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.import_map.lock().unwrap().clone();
        let path = self.config.import_map_path();
        tokio::task::spawn_blocking(move || snapshot.persist(&path))
            .await
            .map_err(|e| ServeError::Io {
                path: self.config.import_map_path(),
                source: Arc::new(std::io::Error::other(e.to_string())),
            })?
    }

    /// Entry file for a source id, or `None` if it has none.
    async fn find_entry(&self, id: &str) -> Result<Option<PathBuf>> {
        let (pkg, subpath) = split_package_specifier(id);
        if subpath.is_none() {
            if let Some(ws) = self.workspaces.get(&pkg) {
                return Ok(ws.entry.clone());
            }
        }
        match self.paths.resolve(id, &self.config.root).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `<pkg>/<path inside the package>`, with a `.js` extension.
    fn web_path(&self, pkg: &str, entry: &Path) -> String {
        let inside = if let Some(ws) = self.workspaces.owner_of(entry) {
            entry.strip_prefix(&ws.dir).ok().map(slash_path)
        } else {
            let full = slash_path(entry);
            let marker = format!("node_modules/{pkg}/");
            full.rfind(&marker).map(|at| full[at + marker.len()..].to_string())
        };
        let inside = inside.unwrap_or_else(|| {
            entry
                .file_name()
                .map_or_else(|| "index.js".to_string(), |n| n.to_string_lossy().into_owned())
        });
        bundled_file_name(&format!("{pkg}/{inside}"))
    }

    /// URL of a file under the web_modules directory.
    fn web_url_for(&self, output_file: &Path) -> Option<String> {
        let rel = output_file.strip_prefix(self.config.web_modules_dir()).ok()?;
        Some(format!("{WEB_MODULES_PREFIX}{}", slash_path(rel)))
    }

    /// URL a not-yet-finished bundle of `id` will get.
    async fn predicted_url(&self, id: &str) -> Result<Option<String>> {
        let pkg = package_name(id);
        Ok(self
            .find_entry(id)
            .await?
            .map(|entry| format!("{WEB_MODULES_PREFIX}{}", self.web_path(&pkg, &entry))))
    }
}

/// Removes a finished bundle from the pending table.
struct PendingGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&self.key);
        }
    }
}

/// Decides, per import met by the bundler, what stays external.
struct BundleHook {
    inner: Arc<Inner>,
    chain: Chain,
}

#[async_trait]
impl ResolveHook for BundleHook {
    async fn resolve(&self, specifier: &str, importer: Option<&Path>) -> Result<Option<ResolvedId>> {
        let inner = &self.inner;
        if has_network_scheme(specifier) {
            return Ok(Some(ResolvedId::external(specifier)));
        }
        if !is_bare_specifier(specifier) {
            return Ok(None);
        }

        if let Some(url) = inner.lookup(specifier) {
            return Ok(Some(ResolvedId::external(url)));
        }

        let pkg = package_name(specifier);
        if inner.config.is_external(&pkg) {
            return Ok(Some(ResolvedId::external(specifier)));
        }

        if inner.workspaces.contains(&pkg) {
            if self.chain.iter().any(|id| id == specifier) {
                debug!(specifier = %specifier, "bundle cycle, pointing at predicted url");
                return Ok(inner.predicted_url(specifier).await?.map(ResolvedId::external));
            }
            debug!(
                specifier = %specifier,
                importer = ?importer,
                "bundling workspace dependency"
            );
            return match inner.bundle_task(specifier, Arc::clone(&self.chain)).await? {
                WebModule::Bundled(url) => Ok(Some(ResolvedId::external(url))),
                WebModule::Passthrough => Ok(None),
            };
        }

        Ok(None)
    }
}

/// Whether an entry file is authored as CommonJS.
///
/// Checked in order: `.mjs`/`.cjs`, the package `type`, the package
/// `module` field, then the source itself.
fn is_commonjs(entry: &Path) -> bool {
    match entry.extension().and_then(|e| e.to_str()) {
        Some("mjs" | "mts") => return false,
        Some("cjs" | "cts") => return true,
        _ => {}
    }

    if let Some((dir, manifest)) = path_resolver::nearest_manifest(entry) {
        match manifest.get("type").and_then(|t| t.as_str()) {
            Some("module") => return false,
            Some("commonjs") => return true,
            _ => {}
        }
        if let Some(module) = manifest.get("module").and_then(|m| m.as_str()) {
            let module_path = dunce::canonicalize(dir.join(module)).unwrap_or_else(|_| dir.join(module));
            if module_path == entry {
                return false;
            }
        }
    }

    match modserve_util::fs::read_to_string_lossy(entry) {
        Ok(source) => !has_module_syntax(&source),
        Err(_) => false,
    }
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn importer_label(importer: Option<&Path>) -> String {
    importer.map_or_else(|| "<root>".to_string(), |p| p.display().to_string())
}

fn resolve_failure(specifier: &str, importer: Option<&Path>, err: &ServeError) -> ServeError {
    if err.is_not_found() {
        ServeError::resolve(specifier, importer_label(importer), "module not found")
    } else {
        ServeError::resolve(specifier, importer_label(importer), err.to_string())
    }
}

#[cfg(test)]
mod tests;
