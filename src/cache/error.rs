//! Error types for the cache and its collaborators.

use thiserror::Error;

/// Failure to produce a fresh artifact for a request.
///
/// `Clone` so that requests queued behind a failed refresh can be handed the
/// same outcome instead of fetching again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
  #[error("upstream request timed out")]
  Timeout,
  #[error("upstream returned status {0}")]
  Status(u16),
  #[error("upstream redirect is missing a usable location: {0}")]
  BadRedirect(String),
  #[error("upstream exceeded {0} redirects")]
  TooManyRedirects(usize),
  #[error("upstream request failed: {0}")]
  Network(String),
  /// The fetch succeeded but the artifact could not be written.
  #[error("failed to store fetched artifact: {0}")]
  StorageUnavailable(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      FetchError::Timeout
    } else if let Some(status) = err.status() {
      FetchError::Status(status.as_u16())
    } else {
      FetchError::Network(err.to_string())
    }
  }
}

/// Errors raised by a [`CacheStorage`](super::storage::CacheStorage) backend.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("metadata record is corrupt: {0}")]
  MetadataCorrupt(String),
  #[error("failed to persist metadata: {0}")]
  MetadataWriteFailed(#[source] std::io::Error),
  #[error("artifact storage unavailable: {0}")]
  StorageUnavailable(#[source] std::io::Error),
}
