//! Core types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

/// Per-call cache policy.
///
/// Defaults: no skip, TTL of zero (always revalidate), no forced refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Bypass the cache entirely: no read, no write.
  pub skip_cache: bool,
  /// Maximum age of a cached entry that may still be served.
  pub ttl_minutes: u32,
  /// Skip the cache read but still write the fresh result back.
  pub force_refresh: bool,
}

impl CacheConfig {
  /// Serve cached data up to `minutes` old.
  pub fn ttl(minutes: u32) -> Self {
    Self {
      ttl_minutes: minutes,
      ..Self::default()
    }
  }

  /// Never read or write the cache.
  pub fn no_cache() -> Self {
    Self {
      skip_cache: true,
      ..Self::default()
    }
  }

  pub fn with_skip_cache(mut self, skip: bool) -> Self {
    self.skip_cache = skip;
    self
  }

  pub fn with_force_refresh(mut self, force: bool) -> Self {
    self.force_refresh = force;
    self
  }

  pub fn with_ttl_minutes(mut self, minutes: u32) -> Self {
    self.ttl_minutes = minutes;
    self
  }

  pub fn max_age(&self) -> Duration {
    Duration::minutes(i64::from(self.ttl_minutes))
  }

  /// Whether a cached entry may be served at all. A zero TTL behaves like
  /// a forced refresh on every call.
  pub fn reads_cache(&self) -> bool {
    !self.skip_cache && !self.force_refresh && self.ttl_minutes > 0
  }

  pub fn writes_cache(&self) -> bool {
    !self.skip_cache
  }
}

/// Result from a gateway read, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_cached(&self) -> bool {
    self.source == CacheSource::CacheFresh
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, within its TTL
  CacheFresh,
}
