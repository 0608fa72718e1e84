use super::*;
use crate::imports::scan_imports;
use std::fs;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

/// Bundler that copies its input, asking the hook about every import.
#[derive(Default)]
struct FakeBundler {
    builds: AtomicUsize,
    delay: Option<Duration>,
    fail_first: bool,
    panic_first: bool,
    inputs: Mutex<Vec<BuildInput>>,
}

impl FakeBundler {
    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bundler for FakeBundler {
    async fn build(&self, request: BuildRequest, hook: &dyn ResolveHook) -> Result<BuildOutput> {
        let call = self.builds.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_first && call == 0 {
            panic!("bundler crashed");
        }
        if self.fail_first && call == 0 {
            return Err(ServeError::bundle("fake", "first build fails"));
        }
        self.inputs.lock().unwrap().push(request.input.clone());

        let (source, importer) = match &request.input {
            BuildInput::Entry(path) => (fs::read_to_string(path).unwrap(), Some(path.clone())),
            BuildInput::Inline { source, .. } => (source.clone(), None),
        };
        let mut externals = Vec::new();
        for span in scan_imports(&source) {
            if let Some(resolved) = hook.resolve(&span.specifier, importer.as_deref()).await? {
                if resolved.external {
                    externals.push(resolved.id);
                }
            }
        }

        fs::create_dir_all(request.output.parent().unwrap()).unwrap();
        fs::write(&request.output, format!("// externals: {externals:?}\n{source}")).unwrap();
        Ok(BuildOutput {
            output_file: request.output,
            externals,
        })
    }
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Workspace with lodash (CommonJS), an ES module package and a stylesheet.
fn fixture() -> (TempDir, Arc<ServerConfig>) {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(
        &root.join("node_modules/lodash/package.json"),
        r#"{"name":"lodash","main":"lodash.js"}"#,
    );
    write(
        &root.join("node_modules/lodash/lodash.js"),
        "module.exports = { get: require('./get'), set };",
    );
    write(
        &root.join("node_modules/lodash/get.js"),
        "module.exports = function get() {};",
    );
    write(
        &root.join("node_modules/esm-pkg/package.json"),
        r#"{"name":"esm-pkg","type":"module","main":"index.js"}"#,
    );
    write(
        &root.join("node_modules/esm-pkg/index.js"),
        "import get from 'lodash';\nexport default get;",
    );
    write(
        &root.join("node_modules/esm-pkg/theme.css"),
        "body { color: red; }",
    );
    write(&root.join("src/main.js"), "import './style.css';");
    write(&root.join("src/style.css"), "body {}");
    write(&root.join("src/util.ts"), "export const x = 1;");

    let config = Arc::new(ServerConfig::new(root.to_path_buf()));
    (dir, config)
}

fn resolver(config: &Arc<ServerConfig>, bundler: &Arc<FakeBundler>) -> ModuleResolver {
    ModuleResolver::builder(Arc::clone(config), Arc::clone(bundler) as Arc<dyn Bundler>).build()
}

#[tokio::test]
async fn test_subpath_import_bundles_package_first() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    let url = resolver.resolve_import("lodash/get", None).await.unwrap();

    assert_eq!(url, "/web_modules/lodash/get.js");
    let map = resolver.import_map();
    assert_eq!(map.get("lodash"), Some("/web_modules/lodash/lodash.js"));
    assert_eq!(map.get("lodash/get"), Some("/web_modules/lodash/get.js"));
    assert_eq!(
        map.get("/node_modules/lodash/lodash.js"),
        Some("/web_modules/lodash/lodash.js")
    );
    assert_eq!(bundler.builds(), 2);
    assert!(config.web_modules_dir().join("lodash/get.js").is_file());
}

#[tokio::test]
async fn test_commonjs_entry_is_bundled_through_proxy() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    resolver.bundle_web_module("lodash").await.unwrap();

    let inputs = bundler.inputs.lock().unwrap();
    match &inputs[0] {
        BuildInput::Inline { source, resolve_dir } => {
            assert!(source.contains("export { default } from"));
            assert!(source.contains("export { get, set } from"));
            assert!(resolve_dir.ends_with("node_modules/lodash"));
        }
        other => panic!("expected inline proxy, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resolve_twice_bundles_once() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    let first = resolver.resolve_import("lodash", None).await.unwrap();
    let builds = bundler.builds();
    let second = resolver.resolve_import("lodash", None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(bundler.builds(), builds);
    assert_eq!(resolver.bundles_built(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bundles_share_one_build() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler {
        delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let resolver = resolver(&config, &bundler);

    let calls = (0..8).map(|_| {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.bundle_web_module("lodash").await })
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(bundler.builds(), 1);
    for result in results {
        assert_eq!(
            result.unwrap().unwrap(),
            WebModule::Bundled("/web_modules/lodash/lodash.js".to_string())
        );
    }
}

#[tokio::test]
async fn test_known_dependencies_become_externals() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    resolver.bundle_web_module("lodash").await.unwrap();
    let url = resolver.resolve_import("esm-pkg", None).await.unwrap();

    assert_eq!(url, "/web_modules/esm-pkg/index.js");
    let bundle = fs::read_to_string(config.web_modules_dir().join("esm-pkg/index.js")).unwrap();
    assert!(bundle.contains("/web_modules/lodash/lodash.js"));
    assert!(matches!(bundler.inputs.lock().unwrap()[1], BuildInput::Entry(_)));
}

#[tokio::test]
async fn test_external_allowlist_is_passthrough() {
    let (dir, _) = fixture();
    let config = Arc::new(
        ServerConfig::new(dir.path().to_path_buf()).with_external(vec!["lodash".to_string()]),
    );
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    let url = resolver.resolve_import("lodash", None).await.unwrap();

    assert_eq!(url, "/node_modules/lodash/lodash.js");
    assert_eq!(bundler.builds(), 0);
    assert!(resolver.import_map().is_passthrough("lodash"));
}

#[tokio::test]
async fn test_missing_package_is_recorded_then_fails_to_resolve() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    let err = resolver.resolve_import("not-installed", None).await.unwrap_err();

    assert!(matches!(err, ServeError::Resolve { .. }));
    assert!(resolver.import_map().is_passthrough("not-installed"));
    assert_eq!(
        resolver.bundle_web_module("not-installed").await.unwrap(),
        WebModule::Passthrough
    );
}

#[tokio::test]
async fn test_local_and_asset_urls() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);
    let main = config.root.join("src/main.js");

    assert_eq!(
        resolver.resolve_import("./util", Some(&main)).await.unwrap(),
        "/src/util.ts"
    );
    assert_eq!(
        resolver.resolve_import("./style.css", Some(&main)).await.unwrap(),
        "/src/style.css?type=module"
    );
    assert_eq!(
        resolver.resolve_import("esm-pkg/theme.css", Some(&main)).await.unwrap(),
        "/node_modules/esm-pkg/theme.css?type=module"
    );

    // A stylesheet importing a stylesheet keeps raw content.
    let style = config.root.join("src/style.css");
    assert_eq!(
        resolver.resolve_import("./style.css", Some(&style)).await.unwrap(),
        "/src/style.css"
    );
}

#[tokio::test]
async fn test_network_specifiers_are_untouched() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    for specifier in ["https://cdn.example.com/x.js", "//cdn.example.com/y.js", "data:text/javascript,1"] {
        assert_eq!(resolver.resolve_import(specifier, None).await.unwrap(), specifier);
    }
    assert_eq!(bundler.builds(), 0);
}

#[tokio::test]
async fn test_failed_bundle_is_retried() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler {
        fail_first: true,
        ..Default::default()
    });
    let resolver = resolver(&config, &bundler);

    let err = resolver.bundle_web_module("lodash").await.unwrap_err();
    assert!(matches!(err, ServeError::Bundle { .. }));
    assert!(!resolver.import_map().knows("lodash"));

    let module = resolver.bundle_web_module("lodash").await.unwrap();
    assert_eq!(module, WebModule::Bundled("/web_modules/lodash/lodash.js".to_string()));
    assert_eq!(bundler.builds(), 2);
}

#[tokio::test]
async fn test_panicking_bundle_is_retried() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler {
        panic_first: true,
        ..Default::default()
    });
    let resolver = resolver(&config, &bundler);

    let err = resolver.bundle_web_module("lodash").await.unwrap_err();
    assert!(matches!(err, ServeError::Bundle { .. }));
    assert!(resolver.inner.pending.lock().unwrap().is_empty());
    assert!(!resolver.import_map().knows("lodash"));

    let module = resolver.bundle_web_module("lodash").await.unwrap();
    assert_eq!(module, WebModule::Bundled("/web_modules/lodash/lodash.js".to_string()));
    assert_eq!(bundler.builds(), 2);
}

#[tokio::test]
async fn test_bundle_timeout() {
    let (dir, _) = fixture();
    let config = Arc::new(
        ServerConfig::new(dir.path().to_path_buf()).with_build_timeout(Duration::from_millis(20)),
    );
    let bundler = Arc::new(FakeBundler {
        delay: Some(Duration::from_millis(500)),
        ..Default::default()
    });
    let resolver = resolver(&config, &bundler);

    let err = resolver.bundle_web_module("lodash").await.unwrap_err();
    assert!(matches!(err, ServeError::Timeout { millis: 20, .. }));
    assert!(resolver.inner.pending.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_persisted_map_skips_rebuild() {
    let (_dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    resolver(&config, &bundler)
        .resolve_import("lodash", None)
        .await
        .unwrap();
    assert_eq!(bundler.builds(), 1);

    let fresh_bundler = Arc::new(FakeBundler::default());
    let fresh = resolver(&config, &fresh_bundler);
    assert_eq!(
        fresh.resolve_import("lodash", None).await.unwrap(),
        "/web_modules/lodash/lodash.js"
    );
    assert_eq!(fresh_bundler.builds(), 0);
}

#[tokio::test]
async fn test_package_installed_after_restart_is_bundled() {
    let (dir, config) = fixture();
    let bundler = Arc::new(FakeBundler::default());
    assert!(resolver(&config, &bundler)
        .resolve_import("late-pkg", None)
        .await
        .is_err());

    write(
        &dir.path().join("node_modules/late-pkg/package.json"),
        r#"{"name":"late-pkg","main":"index.js"}"#,
    );
    write(
        &dir.path().join("node_modules/late-pkg/index.js"),
        "module.exports = { ready: true };",
    );

    let fresh = resolver(&config, &bundler);
    assert_eq!(
        fresh.resolve_import("late-pkg", None).await.unwrap(),
        "/web_modules/late-pkg/index.js"
    );
    assert_eq!(bundler.builds(), 1);
}

#[tokio::test]
async fn test_workspace_cycle_is_broken() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(
        &root.join("package.json"),
        r#"{"name":"mono","workspaces":["packages/*"]}"#,
    );
    write(
        &root.join("packages/a/package.json"),
        r#"{"name":"a","module":"index.js"}"#,
    );
    write(&root.join("packages/a/index.js"), "import b from 'b';\nexport default 1;");
    write(
        &root.join("packages/b/package.json"),
        r#"{"name":"b","module":"index.js"}"#,
    );
    write(&root.join("packages/b/index.js"), "import a from 'a';\nexport default 2;");

    let config = Arc::new(ServerConfig::new(root.to_path_buf()));
    let bundler = Arc::new(FakeBundler::default());
    let resolver = resolver(&config, &bundler);

    let url = resolver.resolve_import("a", None).await.unwrap();

    assert_eq!(url, "/web_modules/a/index.js");
    assert_eq!(resolver.import_map().get("b"), Some("/web_modules/b/index.js"));
    let bundle_b = fs::read_to_string(config.web_modules_dir().join("b/index.js")).unwrap();
    assert!(bundle_b.contains("/web_modules/a/index.js"));
    assert_eq!(bundler.builds(), 2);
}

#[test]
fn test_is_commonjs() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    write(&root.join("plain/index.js"), "module.exports = 1;");
    write(&root.join("esm-src/index.js"), "export default 1;");
    write(&root.join("typed/package.json"), r#"{"type":"module"}"#);
    write(&root.join("typed/index.js"), "module.exports = 1;");
    write(&root.join("explicit.cjs"), "export default 1;");

    assert!(is_commonjs(&root.join("plain/index.js")));
    assert!(!is_commonjs(&root.join("esm-src/index.js")));
    assert!(!is_commonjs(&root.join("typed/index.js")));
    assert!(is_commonjs(&root.join("explicit.cjs")));
}
