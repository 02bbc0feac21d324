//! Single-artifact cache with a TTL and a one-shot grace window.
//!
//! This module provides a caching mechanism that:
//! - Serves the cached artifact unchanged while it is within its TTL
//! - Serves it once more past the TTL, then forces a refresh
//! - Collapses concurrent refreshes into a single upstream fetch
//! - Persists the artifact and its metadata so both survive restarts

mod error;
mod layer;
mod storage;
mod traits;

pub use error::FetchError;
pub use layer::CacheController;
pub use storage::{CacheStorage, FileStorage};
pub use traits::Fetcher;

#[cfg(test)]
pub(crate) use storage::MemoryStorage;
#[cfg(test)]
pub(crate) use traits::CacheMetadata;
