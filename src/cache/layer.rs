//! Cache controller that decides between serving, consuming grace and refreshing.

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::error::FetchError;
use super::storage::CacheStorage;
use super::traits::{CacheMetadata, CacheResult, CacheSource, CacheState, Fetcher};

/// Outcome of the most recent refresh, shared with requests that queued
/// behind it.
#[derive(Debug, Default)]
struct RefreshSlot {
  last_failure: Option<FetchError>,
}

/// In-memory copy of what storage holds. Filled from storage on first use,
/// then kept in step with every successful write.
#[derive(Debug, Clone, Default)]
struct Resident {
  metadata: Option<CacheMetadata>,
  artifact: Option<Bytes>,
}

/// Point-in-time view of the cache, computed without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
  pub state: CacheState,
  pub last_fetch_time: i64,
  pub grace_consumed: bool,
  pub age_secs: i64,
  pub ttl_secs: u64,
  pub has_artifact: bool,
}

/// Single-slot cache in front of a [`Fetcher`].
///
/// Construct once at startup and share behind an `Arc`. Reads within the TTL
/// take no lock and touch no storage. Everything else (grace consumption,
/// refresh) runs under one async mutex, so concurrent requests that all see
/// an expired artifact result in a single upstream fetch.
pub struct CacheController<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  ttl: Duration,
  /// Serve the last good artifact when a refresh fails
  serve_stale_on_error: bool,
  resident: RwLock<Resident>,
  refresh: Mutex<RefreshSlot>,
  /// Number of completed refresh attempts
  attempts: AtomicU64,
}

impl<S: CacheStorage, F: Fetcher> CacheController<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, ttl: Duration) -> Self {
    Self {
      storage,
      fetcher,
      ttl,
      serve_stale_on_error: false,
      resident: RwLock::new(Resident::default()),
      refresh: Mutex::new(RefreshSlot::default()),
      attempts: AtomicU64::new(0),
    }
  }

  /// Fall back to the previous artifact when a refresh fails instead of
  /// returning the error. Requests with nothing cached still fail.
  pub fn with_stale_fallback(mut self, enabled: bool) -> Self {
    self.serve_stale_on_error = enabled;
    self
  }

  /// Get the artifact, refreshing it from upstream if required.
  ///
  /// 1. Evaluate without locking - if fresh, return immediately
  /// 2. Otherwise take the refresh lock and evaluate again
  /// 3. Grace: serve the cached copy and mark the grace as consumed
  /// 4. Refresh: fetch, store artifact and metadata, serve the new copy
  pub async fn get_artifact(&self) -> Result<CacheResult, FetchError> {
    let observed_attempts = self.attempts.load(Ordering::Acquire);

    let (metadata, artifact) = self.snapshot();
    if let Some(data) = self.fresh(&metadata, artifact) {
      return Ok(data);
    }

    let mut slot = self.refresh.lock().await;

    // A refresh finished while we waited; if it failed, share its outcome
    if self.attempts.load(Ordering::Acquire) != observed_attempts {
      if let Some(err) = slot.last_failure.clone() {
        debug!(error = %err, "refresh we waited on failed");
        let (_, previous) = self.snapshot();
        return self.fail(err, previous);
      }
    }

    let (metadata, artifact) = self.snapshot();
    let now = Utc::now();
    let state = CacheState::evaluate(&metadata, artifact.is_some(), now, self.ttl);

    match (state, artifact) {
      (CacheState::Fresh, Some(data)) => Ok(CacheResult::new(data, CacheSource::Fresh)),
      (CacheState::Grace, Some(data)) => {
        info!(
          age = metadata.age_secs(now),
          ttl = self.ttl.as_secs(),
          "serving expired artifact on grace"
        );
        let consumed = CacheMetadata {
          grace_consumed: true,
          ..metadata
        };
        self.persist_metadata(consumed, "failed to persist grace consumption");
        Ok(CacheResult::new(data, CacheSource::Grace))
      }
      (_, artifact) => self.refresh(&mut slot, artifact).await,
    }
  }

  /// Describe the current state without touching it.
  pub fn status(&self) -> CacheStatus {
    let (metadata, artifact) = self.snapshot();
    let has_artifact = artifact.is_some();
    let now = Utc::now();

    CacheStatus {
      state: CacheState::evaluate(&metadata, has_artifact, now, self.ttl),
      last_fetch_time: metadata.last_fetch_time,
      grace_consumed: metadata.grace_consumed,
      age_secs: metadata.age_secs(now),
      ttl_secs: self.ttl.as_secs(),
      has_artifact,
    }
  }

  fn fresh(&self, metadata: &CacheMetadata, artifact: Option<Bytes>) -> Option<CacheResult> {
    let now = Utc::now();
    let state = CacheState::evaluate(metadata, artifact.is_some(), now, self.ttl);
    match (state, artifact) {
      (CacheState::Fresh, Some(data)) => {
        debug!(age = metadata.age_secs(now), "serving fresh artifact");
        Some(CacheResult::new(data, CacheSource::Fresh))
      }
      _ => None,
    }
  }

  /// Fetch once and store the result. Must be called with the refresh lock held.
  async fn refresh(
    &self,
    slot: &mut RefreshSlot,
    previous: Option<Bytes>,
  ) -> Result<CacheResult, FetchError> {
    info!("refreshing artifact from upstream");

    let result = match self.fetcher.fetch().await {
      Ok(data) => self
        .storage
        .write_artifact(&data)
        .map(|_| data)
        .map_err(|e| FetchError::StorageUnavailable(e.to_string())),
      Err(e) => Err(e),
    };
    self.attempts.fetch_add(1, Ordering::Release);

    match result {
      Ok(data) => {
        slot.last_failure = None;
        // Resident bytes first, so fresh metadata never pairs with an old artifact
        self.update_resident(|resident| resident.artifact = Some(data.clone()));
        self.persist_metadata(
          CacheMetadata::fetched_at(Utc::now()),
          "failed to persist metadata after refresh",
        );

        info!(bytes = data.len(), "artifact refreshed");
        Ok(CacheResult::new(data, CacheSource::Network))
      }
      Err(e) => {
        warn!(error = %e, "artifact refresh failed");
        slot.last_failure = Some(e.clone());
        self.fail(e, previous)
      }
    }
  }

  fn fail(&self, err: FetchError, previous: Option<Bytes>) -> Result<CacheResult, FetchError> {
    match previous {
      Some(data) if self.serve_stale_on_error => {
        warn!(error = %err, "serving previous artifact after failed refresh");
        Ok(CacheResult::new(data, CacheSource::StaleFallback))
      }
      _ => Err(err),
    }
  }

  /// Save `metadata` and make it resident. On failure the resident copy keeps
  /// matching what storage holds. Must be called with the refresh lock held.
  fn persist_metadata(&self, metadata: CacheMetadata, context: &str) {
    match self.storage.save_metadata(&metadata) {
      Ok(()) => self.update_resident(|resident| resident.metadata = Some(metadata)),
      Err(e) => error!(error = %e, "{}", context),
    }
  }

  /// Resident metadata and artifact. Storage is read only for whichever of
  /// the two has not been loaded yet, normally just once after startup.
  fn snapshot(&self) -> (CacheMetadata, Option<Bytes>) {
    let Resident { metadata, artifact } = match self.resident.read() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    };

    let metadata = match metadata {
      Some(metadata) => metadata,
      None => {
        let loaded = self.storage.load_metadata();
        // A concurrent refresh may have installed newer metadata meanwhile
        self.update_resident(|resident| {
          resident.metadata.get_or_insert(loaded);
        });
        loaded
      }
    };

    let artifact = match artifact {
      Some(data) => Some(data),
      None => match self.storage.read_artifact() {
        Ok(Some(data)) => {
          self.update_resident(|resident| {
            resident.artifact.get_or_insert_with(|| data.clone());
          });
          Some(data)
        }
        Ok(None) => None,
        Err(e) => {
          warn!(error = %e, "cached artifact unreadable");
          None
        }
      },
    };

    (metadata, artifact)
  }

  fn update_resident(&self, f: impl FnOnce(&mut Resident)) {
    let mut guard = match self.resident.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard);
  }
}
