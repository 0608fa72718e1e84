#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::type_complexity)]

//! Long-running side of modserve.
//!
//! The server provides:
//! - A per-URL resource cache with coalesced builds
//! - File watching that rebuilds or drops exactly the affected URLs
//! - A broadcast channel of `updated` notifications for connected clients
//!
//! The HTTP layer is not part of this crate; anything that can turn a
//! request URL into [`ResourceCache::provide_resource`] can serve it.

pub mod cache;
pub mod changes;
mod dev;
pub mod resource;
pub mod watch;

pub use cache::{apply_watch_events, ResourceCache};
pub use changes::{ChangeEvent, ChangeNotifier};
pub use dev::DevServer;
pub use resource::Resource;
pub use watch::{NotifyWatcher, WatchBridge, WatchEvent, Watcher};
