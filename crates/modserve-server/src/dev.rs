//! One running module server: resolver, transform pipeline, resource cache
//! and file watcher wired together.

use crate::cache::{apply_watch_events, ResourceCache};
use crate::changes::{ChangeEvent, ChangeNotifier};
use crate::resource::Resource;
use crate::watch::{NotifyWatcher, WatchEvent, Watcher};
use modserve_core::{
    Bundler, ModuleResolver, NodeReflector, Result, ScriptTransformer, ServerConfig,
    StyleTransformer, TransformPipeline,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A module server instance.
///
/// Dropping it stops applying file changes.
pub struct DevServer {
    resolver: ModuleResolver,
    cache: ResourceCache,
    events_task: JoinHandle<()>,
}

impl DevServer {
    /// Start with the default collaborators: a native file watcher, and
    /// CommonJS export reflection through `node` when it is on the `PATH`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: Arc<ServerConfig>, bundler: Arc<dyn Bundler>) -> Result<Self> {
        let mut builder = ModuleResolver::builder(Arc::clone(&config), bundler);
        match NodeReflector::from_path(config.build_timeout()) {
            Some(reflector) => builder = builder.reflector(Arc::new(reflector)),
            None => debug!("node not found, CommonJS exports are scanned statically only"),
        }
        let (watcher, events) = NotifyWatcher::start(&config.root)?;
        Ok(Self::with_parts(builder.build(), Arc::new(watcher), events))
    }

    /// Assemble from an existing resolver and watcher.
    pub fn with_parts(
        resolver: ModuleResolver,
        watcher: Arc<dyn Watcher>,
        events: mpsc::UnboundedReceiver<WatchEvent>,
    ) -> Self {
        let config = Arc::clone(resolver.config());
        let pipeline = TransformPipeline::new()
            .with(Arc::new(ScriptTransformer::new(resolver.clone())))
            .with(Arc::new(StyleTransformer));
        let cache = ResourceCache::new(Arc::clone(&config), pipeline, watcher, ChangeNotifier::new());
        let events_task = tokio::spawn(apply_watch_events(cache.clone(), events));

        info!(
            root = %config.root.display(),
            cache = config.cache,
            compression = config.compression.as_str(),
            "module server ready"
        );
        Self {
            resolver,
            cache,
            events_task,
        }
    }

    pub async fn provide_resource(&self, url: &str) -> Result<Arc<Resource>> {
        self.cache.provide_resource(url).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.cache.changes().subscribe()
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn resolver(&self) -> &ModuleResolver {
        &self.resolver
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}
