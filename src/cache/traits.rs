//! Result types shared by the cache layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Oldest cache entry the data was served from, if any
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn new(data: T, source: CacheSource, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source,
      cached_at,
    }
  }

  /// Create a result for stale cached data served because the network failed.
  pub fn offline(data: T) -> Self {
    Self::new(data, CacheSource::Offline, None)
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Everything fetched from the provider
  Network,
  /// Everything served from fresh cache
  CacheFresh,
  /// Cached rows merged with freshly fetched ones
  Hybrid,
  /// Provider failed, serving whatever was cached
  Offline,
  /// Provider and cache both empty, serving generated data
  Mock,
  /// Nothing available
  Empty,
}

impl CacheSource {
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::Hybrid => "hybrid",
      CacheSource::Offline => "offline",
      CacheSource::Mock => "mock",
      CacheSource::Empty => "empty",
    }
  }
}
