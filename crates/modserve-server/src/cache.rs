//! Per-URL resource cache.
//!
//! Each URL has at most one slot: either a built [`Resource`] or the single
//! in-flight build every concurrent requester attaches to. Builds run as
//! detached tasks, so a requester going away never cancels one.
//!
//! Invalidation goes through the [`WatchBridge`]: every file a resource was
//! built from is registered under the resource's URL, and a change to the
//! file rebuilds exactly those URLs.

use crate::changes::ChangeNotifier;
use crate::resource::{Resource, CONTENT_ENCODING, CONTENT_TYPE, ETAG};
use crate::watch::{WatchBridge, WatchEvent, Watcher};
use bytes::Bytes;
use flate2::write::GzEncoder;
use futures::future::{BoxFuture, FutureExt, Shared};
use modserve_core::paths::{content_type_for, locate_file, relative_filename, split_url};
use modserve_core::{
    Compression, Result, ServeError, ServerConfig, TransformInput, TransformOutput,
    TransformPipeline,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bodies smaller than this are never compressed.
const GZIP_MIN_BYTES: usize = 1024;

const MAP_CONTENT_TYPE: &str = "application/json; charset=utf-8";

type ResourceFuture = Shared<BoxFuture<'static, Result<Arc<Resource>>>>;

/// Fails build `build` of `key` if its task unwinds before settling, so
/// the next request starts over instead of joining a dead build.
struct Unsettled {
    inner: Arc<Inner>,
    key: String,
    build: u64,
    armed: bool,
}

impl Drop for Unsettled {
    fn drop(&mut self) {
        if !self.armed || self.inner.slots.is_poisoned() {
            return;
        }
        warn!(url = %self.key, "build aborted");
        let aborted = Err(ServeError::Transform {
            filename: PathBuf::from(&self.key),
            message: "build aborted".to_string(),
        });
        let _ = self.inner.settle(&self.key, self.build, aborted);
    }
}

enum Slot {
    Ready {
        resource: Arc<Resource>,
        /// Relative filenames registered under this URL.
        watched: Vec<String>,
    },
    Pending {
        build: u64,
        future: ResourceFuture,
        /// Registrations inherited from the resource being replaced.
        watched: Vec<String>,
    },
}

impl Slot {
    fn into_watched(self) -> Vec<String> {
        match self {
            Self::Ready { watched, .. } | Self::Pending { watched, .. } => watched,
        }
    }
}

/// Output of one build, before it is stored.
struct Built {
    resource: Arc<Resource>,
    map: Option<Resource>,
}

/// Cache of built resources keyed by request URL.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ServerConfig>,
    pipeline: TransformPipeline,
    bridge: WatchBridge,
    changes: ChangeNotifier,
    /// Lock order: `slots` before the bridge table.
    slots: Mutex<HashMap<String, Slot>>,
    next_build: AtomicU64,
    builds_started: AtomicUsize,
}

impl ResourceCache {
    pub fn new(
        config: Arc<ServerConfig>,
        pipeline: TransformPipeline,
        watcher: Arc<dyn Watcher>,
        changes: ChangeNotifier,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pipeline,
                bridge: WatchBridge::new(watcher),
                changes,
                slots: Mutex::new(HashMap::new()),
                next_build: AtomicU64::new(1),
                builds_started: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.inner.config
    }

    pub fn bridge(&self) -> &WatchBridge {
        &self.inner.bridge
    }

    pub fn changes(&self) -> &ChangeNotifier {
        &self.inner.changes
    }

    /// The resource for a request URL, building it on first use.
    ///
    /// Concurrent calls for the same URL share one build. A failed build
    /// leaves no entry behind, so the next call retries.
    pub async fn provide_resource(&self, url: &str) -> Result<Arc<Resource>> {
        let key = cache_key(url);
        self.inner.slot_future(&key).await
    }

    /// The built resource for a URL, without building.
    pub fn get(&self, url: &str) -> Option<Arc<Resource>> {
        match self.inner.slots.lock().unwrap().get(&cache_key(url)) {
            Some(Slot::Ready { resource, .. }) => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner
            .slots
            .lock()
            .unwrap()
            .contains_key(&cache_key(url))
    }

    /// Number of slots, built or in flight.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds started by this cache, including failed ones.
    pub fn builds_started(&self) -> usize {
        self.inner.builds_started.load(Ordering::SeqCst)
    }

    /// Rebuild every URL depending on `filename` and announce the ones
    /// that succeed. Returns the number of successful rebuilds.
    pub async fn changed(&self, filename: &str) -> usize {
        let urls = self.inner.bridge.dependants(filename);
        if urls.is_empty() {
            debug!(filename = %filename, "change to file without dependants");
            return 0;
        }

        let rebuilds: Vec<_> = urls
            .iter()
            .map(|url| self.inner.rebuild(url))
            .collect();
        let results = futures::future::join_all(rebuilds).await;

        let mut rebuilt = 0;
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(_) => {
                    rebuilt += 1;
                    self.inner.changes.updated(url);
                }
                Err(e) => {
                    warn!(url = %url, filename = %filename, error = %e, "rebuild failed, entry dropped");
                }
            }
        }
        rebuilt
    }

    /// Drop every URL depending on `filename` along with all of their
    /// watches. Returns the number of dropped URLs.
    pub fn removed(&self, filename: &str) -> usize {
        let urls = self.inner.bridge.dependants(filename);
        if urls.is_empty() {
            debug!(filename = %filename, "removal of file without dependants");
            return 0;
        }

        let mut slots = self.inner.slots.lock().unwrap();
        for url in &urls {
            let watched = slots.remove(url).map(Slot::into_watched).unwrap_or_default();
            slots.remove(&map_key(url));
            self.inner.release(url, &watched);
            self.inner.bridge.unregister(filename, url);
        }
        debug!(filename = %filename, dropped = urls.len(), "dropped entries of removed file");
        urls.len()
    }

    /// Remove one URL from the dependants of `filename`.
    pub fn unregister(&self, filename: &str, url: &str) {
        self.inner.bridge.unregister(filename, url);
    }

    pub async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Changed(filename) => {
                self.changed(&filename).await;
            }
            WatchEvent::Removed(filename) => {
                self.removed(&filename);
            }
        }
    }
}

/// Feed settled watch events into the cache until the channel closes.
pub async fn apply_watch_events(cache: ResourceCache, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
    while let Some(event) = events.recv().await {
        debug!(event = ?event, "applying watch event");
        cache.apply(event).await;
    }
    debug!("watch event stream ended");
}

impl Inner {
    fn slot_future(self: &Arc<Self>, key: &str) -> ResourceFuture {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(key) {
            Some(Slot::Ready { resource, .. }) => {
                debug!(url = %key, "cache hit");
                let resource = Arc::clone(resource);
                return futures::future::ready(Ok(resource)).boxed().shared();
            }
            Some(Slot::Pending { future, .. }) => {
                debug!(url = %key, "joining in-flight build");
                return future.clone();
            }
            None => {}
        }
        self.spawn_build(&mut slots, key, Vec::new())
    }

    /// Replace whatever the slot holds with a fresh build.
    fn rebuild(self: &Arc<Self>, key: &str) -> ResourceFuture {
        let mut slots = self.slots.lock().unwrap();
        let watched = slots.remove(key).map(Slot::into_watched).unwrap_or_default();
        self.spawn_build(&mut slots, key, watched)
    }

    fn spawn_build(
        self: &Arc<Self>,
        slots: &mut HashMap<String, Slot>,
        key: &str,
        watched: Vec<String>,
    ) -> ResourceFuture {
        let build = self.next_build.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(self);
        let task_key = key.to_string();
        let timeout = self.config.build_timeout();

        // The task settles under the slots lock, which the caller holds
        // until the pending slot below is in place.
        let handle = tokio::spawn(async move {
            let mut unsettled = Unsettled {
                inner: Arc::clone(&inner),
                key: task_key.clone(),
                build,
                armed: true,
            };
            let result = match tokio::time::timeout(timeout, inner.build(&task_key)).await {
                Ok(result) => result,
                Err(_) => Err(ServeError::Timeout {
                    key: task_key.clone(),
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            };
            unsettled.armed = false;
            inner.settle(&task_key, build, result)
        });

        let task_key = key.to_string();
        let future = async move {
            handle.await.unwrap_or_else(|e| {
                Err(ServeError::Transform {
                    filename: PathBuf::from(task_key),
                    message: format!("build task failed: {e}"),
                })
            })
        }
        .boxed()
        .shared();

        slots.insert(
            key.to_string(),
            Slot::Pending {
                build,
                future: future.clone(),
                watched,
            },
        );
        future
    }

    /// Store the outcome of build `build` for `key`, unless a newer build
    /// or a removal replaced its slot in the meantime.
    fn settle(&self, key: &str, build: u64, result: Result<Built>) -> Result<Arc<Resource>> {
        let mut slots = self.slots.lock().unwrap();
        let current = matches!(slots.get(key), Some(Slot::Pending { build: b, .. }) if *b == build);
        if !current {
            debug!(url = %key, "build superseded");
            return result.map(|built| built.resource);
        }
        let previous = slots.remove(key).map(Slot::into_watched).unwrap_or_default();
        slots.remove(&map_key(key));

        let built = match result {
            Ok(built) => built,
            Err(e) => {
                self.release(key, &previous);
                return Err(e);
            }
        };

        if !self.config.cache {
            self.release(key, &previous);
            return Ok(built.resource);
        }

        let watched = self.reconcile(key, &built.resource, &previous);
        if let Some(map) = built.map {
            slots.insert(
                map_key(key),
                Slot::Ready {
                    resource: Arc::new(map),
                    watched: Vec::new(),
                },
            );
        }
        slots.insert(
            key.to_string(),
            Slot::Ready {
                resource: Arc::clone(&built.resource),
                watched,
            },
        );
        Ok(built.resource)
    }

    /// Register the files of a new resource and release the ones only the
    /// previous resource used. Returns what is now registered.
    fn reconcile(&self, url: &str, resource: &Resource, previous: &[String]) -> Vec<String> {
        let mut watched = Vec::new();
        for filename in self.watched_files(resource) {
            match self.bridge.register(&filename, url) {
                Ok(()) => watched.push(filename),
                Err(e) => warn!(url = %url, filename = %filename, error = %e, "cannot watch file"),
            }
        }
        for filename in previous {
            if !watched.contains(filename) {
                self.bridge.unregister(filename, url);
            }
        }
        watched
    }

    fn release(&self, url: &str, watched: &[String]) {
        for filename in watched {
            self.bridge.unregister(filename, url);
        }
    }

    /// Relative names of the backing file and every auxiliary file that
    /// lies inside the root.
    fn watched_files(&self, resource: &Resource) -> Vec<String> {
        let Some(filename) = &resource.filename else {
            return Vec::new();
        };
        let mut names: Vec<String> = Vec::new();
        for file in std::iter::once(filename).chain(&resource.watch) {
            match relative_filename(&self.config.root, file) {
                Some(name) if !names.contains(&name) => names.push(name),
                Some(_) => {}
                None => debug!(file = %file.display(), "not watching file outside root"),
            }
        }
        names
    }

    async fn build(&self, key: &str) -> Result<Built> {
        self.builds_started.fetch_add(1, Ordering::SeqCst);
        let (pathname, query) = split_url(key);
        let file = locate_file(&self.config, pathname)?;
        let raw = tokio::fs::read(&file)
            .await
            .map_err(|e| ServeError::io(&file, e))?;

        let input = TransformInput {
            filename: file.clone(),
            content: Bytes::from(raw),
            content_type: content_type_for(&file).to_string(),
            query: query.map(String::from),
        };
        let output = self
            .pipeline
            .run(&input)
            .await?
            .unwrap_or_else(|| TransformOutput {
                content: input.content.clone(),
                content_type: input.content_type.clone(),
                ..Default::default()
            });

        let (content, headers) =
            self.encode_body(&file, output.content, &output.content_type, output.headers)?;
        let map = match output.map {
            Some(map) => {
                let (content, headers) = self.encode_body(&file, map, MAP_CONTENT_TYPE, Vec::new())?;
                Some(Resource {
                    pathname: format!("{pathname}.map"),
                    query: None,
                    filename: None,
                    content,
                    headers,
                    links: Vec::new(),
                    watch: Vec::new(),
                })
            }
            None => None,
        };

        info!(url = %key, file = %file.display(), bytes = content.len(), "built resource");
        Ok(Built {
            resource: Arc::new(Resource {
                pathname: pathname.to_string(),
                query: query.map(String::from),
                filename: Some(file),
                content,
                headers,
                links: output.links,
                watch: output.included_files,
            }),
            map,
        })
    }

    /// Fingerprint and optionally compress a body.
    fn encode_body(
        &self,
        file: &Path,
        content: Bytes,
        content_type: &str,
        extra: Vec<(String, String)>,
    ) -> Result<(Bytes, Vec<(String, String)>)> {
        let mut headers = vec![
            (CONTENT_TYPE.to_string(), content_type.to_string()),
            (ETAG.to_string(), modserve_util::hash::etag(&content)),
        ];
        headers.extend(extra);

        if self.config.compression == Compression::Gzip && content.len() >= GZIP_MIN_BYTES {
            let compressed = gzip(&content).map_err(|e| ServeError::io(file, e))?;
            headers.push((CONTENT_ENCODING.to_string(), Compression::Gzip.as_str().to_string()));
            return Ok((Bytes::from(compressed), headers));
        }
        Ok((content, headers))
    }
}

/// Cache key of a request URL: the fragment never reaches the server.
fn cache_key(url: &str) -> String {
    url.split('#').next().unwrap_or(url).to_string()
}

fn map_key(url: &str) -> String {
    format!("{url}.map")
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
