//! A built, servable response body.

use bytes::Bytes;
use std::path::PathBuf;

/// Response headers are stored lowercase.
pub const CONTENT_TYPE: &str = "content-type";
pub const CONTENT_ENCODING: &str = "content-encoding";
pub const ETAG: &str = "etag";

/// The cached result of serving one URL.
///
/// Immutable once built; a reload replaces the whole value in its cache
/// slot, so requesters holding the old `Arc` keep a consistent view.
#[derive(Debug, Clone)]
pub struct Resource {
    pub pathname: String,
    pub query: Option<String>,
    /// Backing file, if the resource came from one.
    pub filename: Option<PathBuf>,
    pub content: Bytes,
    pub headers: Vec<(String, String)>,
    /// URLs this resource imports.
    pub links: Vec<String>,
    /// Files besides `filename` whose change must rebuild this resource.
    pub watch: Vec<PathBuf>,
}

impl Resource {
    /// The URL this resource is cached under.
    pub fn url(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{query}", self.pathname),
            None => self.pathname.clone(),
        }
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    pub fn etag(&self) -> Option<&str> {
        self.header(ETAG)
    }

    pub fn is_compressed(&self) -> bool {
        self.header(CONTENT_ENCODING).is_some()
    }
}
