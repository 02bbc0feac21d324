//! Core traits and types for the cache.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::FetchError;

/// Source of fresh artifacts.
///
/// Implementors normalize every failure (timeout, bad status, transport)
/// into a [`FetchError`]. The cache calls `fetch` at most once per refresh
/// decision and never retries.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self) -> Result<Bytes, FetchError>;
}

/// Persisted bookkeeping for the single cached artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
  /// Unix seconds of the last successful fetch, `0` before the first one
  pub last_fetch_time: i64,
  /// Whether the one stale serve past the TTL has been used up
  pub grace_consumed: bool,
}

impl CacheMetadata {
  /// Metadata recorded right after a successful fetch.
  pub fn fetched_at(now: DateTime<Utc>) -> Self {
    Self {
      last_fetch_time: now.timestamp(),
      grace_consumed: false,
    }
  }

  /// Seconds elapsed since the last fetch. Negative if the clock went backwards.
  pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
    now.timestamp() - self.last_fetch_time
  }
}

/// What a read request should do, given the current metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
  /// Within the TTL; serve as-is.
  Fresh,
  /// Past the TTL for the first time; serve once more and consume the grace.
  Grace,
  /// Grace already used, or nothing recorded yet; fetch before serving.
  Refresh,
}

impl CacheState {
  /// Derive the state from metadata and wall-clock time.
  ///
  /// Pure: no state is cached between requests.
  pub fn evaluate(
    metadata: &CacheMetadata,
    has_artifact: bool,
    now: DateTime<Utc>,
    ttl: Duration,
  ) -> Self {
    // A zero timestamp means no fetch was ever recorded (or the record was lost)
    if !has_artifact || metadata.last_fetch_time == 0 {
      return CacheState::Refresh;
    }

    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    if metadata.age_secs(now) < ttl_secs {
      CacheState::Fresh
    } else if !metadata.grace_consumed {
      CacheState::Grace
    } else {
      CacheState::Refresh
    }
  }
}

/// Result from a cache read, including where the bytes came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The artifact payload
  pub data: Bytes,
  /// Where the payload came from
  pub source: CacheSource,
}

impl CacheResult {
  pub fn new(data: Bytes, source: CacheSource) -> Self {
    Self { data, source }
  }
}

/// Indicates where served bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Cached artifact within its TTL
  Fresh,
  /// Cached artifact past its TTL, served on the grace allowance
  Grace,
  /// Newly fetched from upstream
  Network,
  /// Refresh failed, serving the last good artifact
  StaleFallback,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Fresh => "fresh",
      CacheSource::Grace => "grace",
      CacheSource::Network => "network",
      CacheSource::StaleFallback => "stale-fallback",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  const TTL: Duration = Duration::from_secs(600);

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
  }

  fn meta(age: i64, grace_consumed: bool) -> CacheMetadata {
    CacheMetadata {
      last_fetch_time: now().timestamp() - age,
      grace_consumed,
    }
  }

  #[test]
  fn test_no_artifact_always_refreshes() {
    let fresh = meta(10, false);
    assert_eq!(
      CacheState::evaluate(&fresh, false, now(), TTL),
      CacheState::Refresh
    );
    assert_eq!(
      CacheState::evaluate(&CacheMetadata::default(), false, now(), TTL),
      CacheState::Refresh
    );
  }

  #[test]
  fn test_within_ttl_is_fresh() {
    assert_eq!(
      CacheState::evaluate(&meta(500, false), true, now(), TTL),
      CacheState::Fresh
    );
    assert_eq!(
      CacheState::evaluate(&meta(599, false), true, now(), TTL),
      CacheState::Fresh
    );
  }

  #[test]
  fn test_ttl_boundary_enters_grace() {
    assert_eq!(
      CacheState::evaluate(&meta(600, false), true, now(), TTL),
      CacheState::Grace
    );
    assert_eq!(
      CacheState::evaluate(&meta(700, false), true, now(), TTL),
      CacheState::Grace
    );
  }

  #[test]
  fn test_consumed_grace_refreshes() {
    assert_eq!(
      CacheState::evaluate(&meta(700, true), true, now(), TTL),
      CacheState::Refresh
    );
  }

  #[test]
  fn test_zero_metadata_with_artifact_refreshes() {
    assert_eq!(
      CacheState::evaluate(&CacheMetadata::default(), true, now(), TTL),
      CacheState::Refresh
    );
  }

  #[test]
  fn test_future_timestamp_is_fresh() {
    assert_eq!(
      CacheState::evaluate(&meta(-30, false), true, now(), TTL),
      CacheState::Fresh
    );
  }

  #[test]
  fn test_fetched_at_resets_grace() {
    let m = CacheMetadata::fetched_at(now());
    assert_eq!(m.last_fetch_time, now().timestamp());
    assert!(!m.grace_consumed);
    assert_eq!(m.age_secs(now()), 0);
  }
}
