//! Per-content-type source transformers.
//!
//! The resource cache runs every file through a [`TransformPipeline`]. The
//! first transformer that claims a file produces its served content; a file
//! nobody claims is served as-is.

mod script;
mod style;

pub use script::ScriptTransformer;
pub use style::StyleTransformer;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

/// A file about to be served.
#[derive(Debug, Clone)]
pub struct TransformInput {
    pub filename: PathBuf,
    pub content: Bytes,
    pub content_type: String,
    /// Query string of the request URL, without `?`.
    pub query: Option<String>,
}

/// What a transformer produced.
#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub content: Bytes,
    pub content_type: String,
    /// Extra response headers.
    pub headers: Vec<(String, String)>,
    /// URLs this resource imports.
    pub links: Vec<String>,
    /// Files besides the source whose change invalidates the output.
    pub included_files: Vec<PathBuf>,
    /// Debug map, served under the resource URL plus `.map`.
    pub map: Option<Bytes>,
}

#[async_trait]
pub trait Transformer: Send + Sync {
    /// `Ok(None)` means this transformer does not handle the input.
    async fn transform(&self, input: &TransformInput) -> Result<Option<TransformOutput>>;
}

/// Ordered list of transformers.
#[derive(Clone, Default)]
pub struct TransformPipeline {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Run the first transformer that claims the input.
    pub async fn run(&self, input: &TransformInput) -> Result<Option<TransformOutput>> {
        for transformer in &self.transformers {
            if let Some(output) = transformer.transform(input).await? {
                return Ok(Some(output));
            }
        }
        Ok(None)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl Transformer for Upper {
        async fn transform(&self, input: &TransformInput) -> Result<Option<TransformOutput>> {
            if input.content_type != "text/plain" {
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&input.content).to_uppercase();
            Ok(Some(TransformOutput {
                content: Bytes::from(text),
                content_type: input.content_type.clone(),
                ..Default::default()
            }))
        }
    }

    struct Never;

    #[async_trait]
    impl Transformer for Never {
        async fn transform(&self, _input: &TransformInput) -> Result<Option<TransformOutput>> {
            panic!("pipeline should stop at the first match");
        }
    }

    fn input(content_type: &str) -> TransformInput {
        TransformInput {
            filename: PathBuf::from("/project/a.txt"),
            content: Bytes::from_static(b"hello"),
            content_type: content_type.to_string(),
            query: None,
        }
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let pipeline = TransformPipeline::new()
            .with(Arc::new(Upper))
            .with(Arc::new(Never));
        let output = pipeline.run(&input("text/plain")).await.unwrap().unwrap();
        assert_eq!(&output.content[..], b"HELLO");
    }

    #[tokio::test]
    async fn test_unclaimed_input() {
        let pipeline = TransformPipeline::new().with(Arc::new(Upper));
        assert!(pipeline.run(&input("image/png")).await.unwrap().is_none());
    }
}
