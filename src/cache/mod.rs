//! TTL caching layer between callers and the request dispatcher.
//!
//! This module:
//! - Serves fresh cached responses without touching the network
//! - Writes successful responses through under a canonical request key
//! - Leaves cached entries alone when a refresh fails
//! - Coalesces concurrent identical fetches into one request
//! - Supports explicit invalidation by request, by path, or all at once

mod key;
mod layer;
mod storage;
mod traits;

pub use key::{CacheKey, CACHE_PREFIX};
pub use layer::CacheLayer;
pub use storage::{CacheEntry, CacheStorage, SecureCacheStorage};
pub use traits::{CacheConfig, CacheResult, CacheSource};
