use super::{TransformInput, TransformOutput, Transformer};
use crate::error::Result;
use crate::imports::{rewrite_imports, scan_imports};
use crate::modules::ModuleResolver;
use crate::paths::has_network_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

const SCRIPT_CONTENT_TYPE: &str = "application/javascript; charset=utf-8";

/// Rewrites import specifiers in script modules to servable URLs.
///
/// Bare imports go through the [`ModuleResolver`], so the first request for
/// a file importing a package is what triggers that package's bundle.
/// JSON files are wrapped as a default export.
pub struct ScriptTransformer {
    resolver: ModuleResolver,
}

impl ScriptTransformer {
    #[must_use]
    pub fn new(resolver: ModuleResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Transformer for ScriptTransformer {
    async fn transform(&self, input: &TransformInput) -> Result<Option<TransformOutput>> {
        let config = self.resolver.config();
        if !config.is_script(&input.filename) {
            return Ok(None);
        }
        // Bundles already carry final URLs.
        if input.filename.starts_with(config.out_dir()) {
            return Ok(None);
        }

        let source = String::from_utf8_lossy(&input.content);
        let is_json = input
            .filename
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            return Ok(Some(TransformOutput {
                content: Bytes::from(format!("export default {};\n", source.trim())),
                content_type: SCRIPT_CONTENT_TYPE.to_string(),
                ..Default::default()
            }));
        }

        let spans = scan_imports(&source);
        let mut replacements = Vec::with_capacity(spans.len());
        let mut links = Vec::new();
        for span in spans {
            let url = self
                .resolver
                .resolve_import(&span.specifier, Some(&input.filename))
                .await
                .map_err(|e| e.in_file(&input.filename))?;
            if !has_network_scheme(&url) && !links.contains(&url) {
                links.push(url.clone());
            }
            if url != span.specifier {
                replacements.push((span, url));
            }
        }
        debug!(
            file = %input.filename.display(),
            rewritten = replacements.len(),
            "rewrote imports"
        );

        Ok(Some(TransformOutput {
            content: Bytes::from(rewrite_imports(&source, &replacements)),
            content_type: SCRIPT_CONTENT_TYPE.to_string(),
            links,
            ..Default::default()
        }))
    }
}
