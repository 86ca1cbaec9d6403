//! Cache storage trait and secure-store implementation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::key::{path_prefix, CacheKey, CACHE_PREFIX};
use crate::store::SecureStore;

/// A cached response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub payload: Value,
  /// When the response was received
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(payload: Value, stored_at: DateTime<Utc>) -> Self {
    Self { payload, stored_at }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.stored_at
  }

  /// Fresh while `0 <= age <= max_age`; the boundary itself still counts.
  /// An entry stamped in the future (clock moved backwards) is stale.
  pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    let age = self.age(now);
    age >= Duration::zero() && age <= max_age
  }
}

/// Trait for cache storage backends.
///
/// Entries are replaced whole, never merged.
pub trait CacheStorage: Send + Sync {
  fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

  fn store_entry(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;

  fn remove_entry(&self, key: &CacheKey) -> Result<()>;

  /// Remove every cached variant of a path.
  fn remove_path(&self, path: &str) -> Result<usize>;

  /// Remove all cached entries.
  fn clear(&self) -> Result<usize>;
}

/// Cache entries kept in a [`SecureStore`], one JSON value per key.
pub struct SecureCacheStorage<S: SecureStore> {
  store: Arc<S>,
}

impl<S: SecureStore> SecureCacheStorage<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }
}

impl<S: SecureStore> CacheStorage for SecureCacheStorage<S> {
  fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let Some(raw) = self.store.get(&key.storage_key())? else {
      return Ok(None);
    };

    let entry = serde_json::from_str(&raw)
      .map_err(|e| eyre!("Failed to deserialize cache entry for {}: {}", key, e))?;
    Ok(Some(entry))
  }

  fn store_entry(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
    let raw = serde_json::to_string(entry)
      .map_err(|e| eyre!("Failed to serialize cache entry for {}: {}", key, e))?;
    self.store.set(&key.storage_key(), Some(&raw))
  }

  fn remove_entry(&self, key: &CacheKey) -> Result<()> {
    self.store.set(&key.storage_key(), None)
  }

  fn remove_path(&self, path: &str) -> Result<usize> {
    self.store.remove_prefix(&path_prefix(path))
  }

  fn clear(&self) -> Result<usize> {
    self.store.remove_prefix(CACHE_PREFIX)
  }
}
