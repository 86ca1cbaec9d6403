//! Session-aware TTL caching gateway for the feed backend.
//!
//! Callers go through [`Gateway`], which layers a TTL cache
//! ([`cache::CacheLayer`]) over an authenticating request dispatcher
//! ([`api::Dispatcher`]). Session state and cached responses share one
//! encrypted key-value store ([`store::SecureStore`]). Paged endpoints are
//! walked by [`pagination::fetch_all`]; local state changes that wait on the
//! server go through [`optimistic`].

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod optimistic;
pub mod pagination;
pub mod session;
pub mod store;

pub use cache::{CacheConfig, CacheResult, CacheSource};
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use gateway::Gateway;
pub use session::{SessionState, User};
