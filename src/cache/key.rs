//! Canonical cache keys.

use reqwest::Method;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::api::Params;

/// Prefix of every cache entry in the secure store.
pub const CACHE_PREFIX: &str = "cache:";

/// Identity of one cacheable request: method, path and normalized query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  path: String,
  canonical: String,
}

impl CacheKey {
  pub fn new(method: &Method, path: &str, params: &Params) -> Self {
    let path = normalize_path(path).to_string();
    // Params is a sorted map, so the encoding is order-independent
    let query = url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(params.iter())
      .finish();

    let canonical = if query.is_empty() {
      format!("{} {}", method, path)
    } else {
      format!("{} {}?{}", method, path, query)
    };

    Self { path, canonical }
  }

  pub fn get(path: &str, params: &Params) -> Self {
    Self::new(&Method::GET, path, params)
  }

  /// Human-readable identity, e.g. `GET posts/?page=2`.
  pub fn canonical(&self) -> &str {
    &self.canonical
  }

  /// Key in the secure store. Grouped by path so every variant of one
  /// endpoint can be dropped with a single prefix delete.
  pub fn storage_key(&self) -> String {
    format!("{}{}", path_prefix(&self.path), digest(&self.canonical))
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical)
  }
}

/// Storage prefix shared by every cached variant of `path`.
pub fn path_prefix(path: &str) -> String {
  format!("{}{}:", CACHE_PREFIX, digest(normalize_path(path)))
}

fn normalize_path(path: &str) -> &str {
  path.trim().trim_start_matches('/')
}

/// SHA256 hash for stable, fixed-length keys
fn digest(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}
