//! Cache layer that orchestrates caching logic with network fetching.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::key::CacheKey;
use super::storage::{CacheEntry, CacheStorage};
use super::traits::{CacheConfig, CacheResult};
use crate::api::{Dispatcher, Params, Request};
use crate::clock::{Clock, SystemClock};
use crate::error::{ApiError, ApiResult};

type InFlight = Shared<BoxFuture<'static, ApiResult<CacheEntry>>>;

/// Network fetches currently running, by canonical key.
///
/// `generation` moves on every invalidation. A fetch started under an older
/// generation, or replaced by a forced refresh of the same key, is neither
/// joined nor written back.
#[derive(Default)]
struct Flights {
  generation: u64,
  next_id: u64,
  running: HashMap<String, (u64, InFlight)>,
  superseded: HashSet<u64>,
}

/// TTL cache in front of the request dispatcher.
///
/// Every read goes through [`CacheLayer::get`], which serves fresh entries
/// without touching the network and writes successful responses back.
/// Failed fetches never evict what is already cached, and never fall back
/// to stale data either: the error goes to the caller.
pub struct CacheLayer<C: CacheStorage> {
  storage: Arc<C>,
  dispatcher: Dispatcher,
  clock: Arc<dyn Clock>,
  flights: Arc<Mutex<Flights>>,
}

impl<C: CacheStorage + 'static> CacheLayer<C> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: C, dispatcher: Dispatcher) -> Self {
    Self {
      storage: Arc::new(storage),
      dispatcher,
      clock: Arc::new(SystemClock),
      flights: Arc::new(Mutex::new(Flights::default())),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  pub fn storage(&self) -> &C {
    &self.storage
  }

  /// Fetch `path` with the given query parameters under `config`.
  ///
  /// 1. `skip_cache`: network only, the cache is neither read nor written
  /// 2. `force_refresh` or zero TTL: skip the read, write through on success
  /// 3. Otherwise serve the cached entry if it is within its TTL
  /// 4. On a miss, fetch and write through
  ///
  /// A storage failure on the read or write side is logged and treated as
  /// a miss; it never fails the request.
  pub async fn get(
    &self,
    path: &str,
    params: &Params,
    config: CacheConfig,
  ) -> ApiResult<CacheResult<Value>> {
    let request = Request::get(path).with_query(params);

    if !config.writes_cache() {
      debug!(path, "cache skipped");
      let payload = self.dispatcher.send(&request).await?;
      return Ok(CacheResult::from_network(payload));
    }

    let key = CacheKey::get(path, params);

    if config.reads_cache() {
      match self.storage.get_entry(&key) {
        Ok(Some(entry)) if entry.is_fresh(self.clock.now(), config.max_age()) => {
          debug!(key = %key, "cache hit");
          return Ok(CacheResult::from_cache(entry.payload, entry.stored_at));
        }
        Ok(Some(entry)) => {
          debug!(key = %key, age_secs = entry.age(self.clock.now()).num_seconds(), "cache stale");
        }
        Ok(None) => debug!(key = %key, "cache miss"),
        Err(err) => warn!(key = %key, error = %err, "cache read failed, treating as miss"),
      }
    } else {
      debug!(key = %key, force_refresh = config.force_refresh, "cache read bypassed");
    }

    // A forced refresh must hit the network, so it never joins a fetch
    // that may have started before whatever prompted the refresh.
    let entry = self
      .fetch_through(key, request, !config.force_refresh)
      .await?;
    Ok(CacheResult::from_network(entry.payload))
  }

  /// [`CacheLayer::get`], deserializing the payload into `T`.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    params: &Params,
    config: CacheConfig,
  ) -> ApiResult<CacheResult<T>> {
    let result = self.get(path, params, config).await?;
    let CacheResult {
      data,
      source,
      cached_at,
    } = result;
    let data = serde_json::from_value(data).map_err(|e| ApiError::Decode(e.to_string()))?;

    Ok(CacheResult {
      data,
      source,
      cached_at,
    })
  }

  /// Send a mutating request, bypassing the cache. On success, every
  /// cached variant of each path in `invalidate` is dropped, and reads
  /// still in flight from before the mutation are not stored.
  pub async fn mutate(&self, request: Request, invalidate: &[&str]) -> ApiResult<Value> {
    let payload = self.dispatcher.send(&request).await?;
    self.next_generation();

    for path in invalidate {
      if let Err(err) = self.invalidate_path(path) {
        warn!(path, error = %err, "cache invalidation after mutation failed");
      }
    }

    Ok(payload)
  }

  /// Drop the cached entry for one request.
  pub fn invalidate(&self, path: &str, params: &Params) -> ApiResult<()> {
    let key = CacheKey::get(path, params);
    debug!(key = %key, "invalidating cache entry");
    self.next_generation();
    self.storage.remove_entry(&key).map_err(ApiError::storage)
  }

  /// Drop every cached variant of `path`, whatever its parameters.
  pub fn invalidate_path(&self, path: &str) -> ApiResult<usize> {
    self.next_generation();
    let removed = self.storage.remove_path(path).map_err(ApiError::storage)?;
    debug!(path, removed, "invalidated cached path");
    Ok(removed)
  }

  /// Drop all cached entries.
  pub fn clear(&self) -> ApiResult<usize> {
    self.next_generation();
    let removed = self.storage.clear().map_err(ApiError::storage)?;
    debug!(removed, "cache cleared");
    Ok(removed)
  }

  /// Fetch from the network and write the result through.
  ///
  /// With `join` set, concurrent calls for the same key share one request:
  /// the first caller starts it, later callers await the same future.
  async fn fetch_through(
    &self,
    key: CacheKey,
    request: Request,
    join: bool,
  ) -> ApiResult<CacheEntry> {
    let fetch = {
      let mut flights = self.lock_flights();

      let existing = match flights.running.get(key.canonical()) {
        Some((_, running)) if join => Some(running.clone()),
        _ => None,
      };

      if let Some(existing) = existing {
        debug!(key = %key, "joining in-flight request");
        existing
      } else {
        let id = flights.next_id;
        flights.next_id += 1;
        let fetch = self.start_fetch(key.clone(), request, flights.generation, id);
        let replaced = flights
          .running
          .insert(key.canonical().to_string(), (id, fetch.clone()));
        if let Some((old, _)) = replaced {
          flights.superseded.insert(old);
        }
        fetch
      }
    };

    fetch.await
  }

  fn start_fetch(&self, key: CacheKey, request: Request, generation: u64, id: u64) -> InFlight {
    let dispatcher = self.dispatcher.clone();
    let storage = Arc::clone(&self.storage);
    let clock = Arc::clone(&self.clock);
    let flights = Arc::clone(&self.flights);

    async move {
      let result = dispatcher
        .send(&request)
        .await
        .map(|payload| CacheEntry::new(payload, clock.now()));

      // Held across the write so an invalidation cannot slip in between
      // the generation check and the store.
      let mut state = flights.lock().unwrap_or_else(|e| e.into_inner());
      let current = state.generation == generation && !state.superseded.remove(&id);

      match &result {
        Ok(entry) if current => {
          match storage.store_entry(&key, entry) {
            Ok(()) => debug!(key = %key, "cache updated"),
            Err(err) => warn!(key = %key, error = %err, "cache write failed"),
          }
        }
        Ok(_) => debug!(key = %key, "fetch outdated before it finished, response not stored"),
        Err(err) => debug!(key = %key, error = %err, "fetch failed, cached entry left untouched"),
      }

      if matches!(state.running.get(key.canonical()), Some((current, _)) if *current == id) {
        state.running.remove(key.canonical());
      }
      drop(state);

      result
    }
    .boxed()
    .shared()
  }

  /// Start a new generation: running fetches are forgotten and will not
  /// write back.
  fn next_generation(&self) {
    let mut flights = self.lock_flights();
    flights.generation += 1;
    flights.running.clear();
    flights.superseded.clear();
  }

  fn lock_flights(&self) -> std::sync::MutexGuard<'_, Flights> {
    self.flights.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl<C: CacheStorage> Clone for CacheLayer<C> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      dispatcher: self.dispatcher.clone(),
      clock: Arc::clone(&self.clock),
      flights: Arc::clone(&self.flights),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::Anonymous;
  use crate::cache::SecureCacheStorage;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;
  use chrono::Duration;
  use color_eyre::eyre::eyre;
  use serde_json::json;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  struct Harness {
    server: MockServer,
    store: Arc<MemoryStore>,
    clock: ManualClock,
    cache: CacheLayer<SecureCacheStorage<MemoryStore>>,
  }

  async fn harness() -> Harness {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::default();
    let dispatcher = Dispatcher::new(&server.uri(), Arc::new(Anonymous)).unwrap();
    let cache = CacheLayer::new(SecureCacheStorage::new(Arc::clone(&store)), dispatcher)
      .with_clock(Arc::new(clock.clone()));

    Harness {
      server,
      store,
      clock,
      cache,
    }
  }

  async fn mount_posts(server: &MockServer, body: Value) {
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(body))
      .mount(server)
      .await;
  }

  async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map(|r| r.len()).unwrap_or(0)
  }

  #[tokio::test]
  async fn skip_cache_never_touches_storage() {
    let h = harness().await;
    mount_posts(&h.server, json!({"results": []})).await;

    let before = h.store.snapshot();
    let config = CacheConfig::ttl(60).with_skip_cache(true);
    h.cache.get("posts/", &Params::new(), config).await.unwrap();
    h.cache.get("posts/", &Params::new(), config).await.unwrap();

    assert_eq!(h.store.snapshot(), before);
    assert!(h.store.is_empty());
    assert_eq!(request_count(&h.server).await, 2);
  }

  #[tokio::test]
  async fn fresh_entry_is_served_without_network() {
    let h = harness().await;
    let key = CacheKey::get("posts/", &Params::new());
    let payload = json!({"results": [{"id": 1, "caption": "hello"}], "next": null});
    h.cache
      .storage()
      .store_entry(&key, &CacheEntry::new(payload.clone(), h.clock.now()))
      .unwrap();
    h.clock.advance(Duration::minutes(59));

    let result = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();

    assert!(result.is_cached());
    assert_eq!(result.data, payload);
    assert_eq!(request_count(&h.server).await, 0);
  }

  #[tokio::test]
  async fn second_identical_get_is_a_cache_hit() {
    let h = harness().await;
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
      .expect(1)
      .mount(&h.server)
      .await;

    let first = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(5))
      .await
      .unwrap();
    let second = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(5))
      .await
      .unwrap();

    assert!(!first.is_cached());
    assert!(second.is_cached());
    assert_eq!(first.data, second.data);
  }

  #[tokio::test]
  async fn force_refresh_always_fetches_and_overwrites() {
    let h = harness().await;
    let key = CacheKey::get("posts/", &Params::new());
    h.cache
      .storage()
      .store_entry(&key, &CacheEntry::new(json!({"old": true}), h.clock.now()))
      .unwrap();
    mount_posts(&h.server, json!({"old": false})).await;
    h.clock.advance(Duration::minutes(1));

    let result = h
      .cache
      .get(
        "posts/",
        &Params::new(),
        CacheConfig::ttl(60).with_force_refresh(true),
      )
      .await
      .unwrap();

    assert!(!result.is_cached());
    assert_eq!(result.data, json!({"old": false}));
    assert_eq!(request_count(&h.server).await, 1);

    let stored = h.cache.storage().get_entry(&key).unwrap().unwrap();
    assert_eq!(stored.payload, json!({"old": false}));
    assert_eq!(stored.stored_at, h.clock.now());
  }

  #[tokio::test]
  async fn zero_ttl_revalidates_every_call() {
    let h = harness().await;
    mount_posts(&h.server, json!([])).await;

    for _ in 0..3 {
      h.cache
        .get("posts/", &Params::new(), CacheConfig::default())
        .await
        .unwrap();
    }

    assert_eq!(request_count(&h.server).await, 3);
    assert_eq!(h.store.len(), 1);
  }

  #[tokio::test]
  async fn ttl_window_scenario() {
    let h = harness().await;
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
      .up_to_n_times(1)
      .mount(&h.server)
      .await;
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 2})))
      .mount(&h.server)
      .await;
    let config = CacheConfig::ttl(60);

    let t0 = h.cache.get("/posts/", &Params::new(), config).await.unwrap();
    assert_eq!(t0.data, json!({"v": 1}));
    assert_eq!(request_count(&h.server).await, 1);

    h.clock.advance(Duration::minutes(30));
    let t30 = h.cache.get("/posts/", &Params::new(), config).await.unwrap();
    assert!(t30.is_cached());
    assert_eq!(t30.data, json!({"v": 1}));
    assert_eq!(request_count(&h.server).await, 1);

    h.clock.advance(Duration::minutes(31));
    let t61 = h.cache.get("/posts/", &Params::new(), config).await.unwrap();
    assert!(!t61.is_cached());
    assert_eq!(t61.data, json!({"v": 2}));
    assert_eq!(request_count(&h.server).await, 2);

    let again = h.cache.get("/posts/", &Params::new(), config).await.unwrap();
    assert_eq!(again.data, json!({"v": 2}));
    assert_eq!(request_count(&h.server).await, 2);
  }

  #[tokio::test]
  async fn failed_refresh_keeps_stale_entry_and_returns_error() {
    let h = harness().await;
    let key = CacheKey::get("posts/", &Params::new());
    let stale = CacheEntry::new(json!({"cached": true}), h.clock.now());
    h.cache.storage().store_entry(&key, &stale).unwrap();
    h.clock.advance(Duration::minutes(120));
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(
        ResponseTemplate::new(500).set_body_json(json!({"detail": "Server exploded."})),
      )
      .mount(&h.server)
      .await;

    let err = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert_eq!(err.to_string(), "Server exploded.");
    assert_eq!(h.cache.storage().get_entry(&key).unwrap(), Some(stale));
  }

  struct BrokenStorage;

  impl CacheStorage for BrokenStorage {
    fn get_entry(&self, _key: &CacheKey) -> color_eyre::Result<Option<CacheEntry>> {
      Err(eyre!("disk I/O error"))
    }

    fn store_entry(&self, _key: &CacheKey, _entry: &CacheEntry) -> color_eyre::Result<()> {
      Err(eyre!("disk I/O error"))
    }

    fn remove_entry(&self, _key: &CacheKey) -> color_eyre::Result<()> {
      Err(eyre!("disk I/O error"))
    }

    fn remove_path(&self, _path: &str) -> color_eyre::Result<usize> {
      Err(eyre!("disk I/O error"))
    }

    fn clear(&self) -> color_eyre::Result<usize> {
      Err(eyre!("disk I/O error"))
    }
  }

  #[tokio::test]
  async fn storage_failures_degrade_to_network() {
    let server = MockServer::start().await;
    mount_posts(&server, json!({"ok": true})).await;
    let dispatcher = Dispatcher::new(&server.uri(), Arc::new(Anonymous)).unwrap();
    let cache = CacheLayer::new(BrokenStorage, dispatcher);

    let result = cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();

    assert_eq!(result.data, json!({"ok": true}));
    assert!(matches!(cache.clear(), Err(ApiError::Storage(_))));
  }

  #[tokio::test]
  async fn concurrent_identical_gets_share_one_request() {
    let h = harness().await;
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({"results": [1]}))
          .set_delay(std::time::Duration::from_millis(200)),
      )
      .expect(1)
      .mount(&h.server)
      .await;

    let config = CacheConfig::ttl(10);
    let params = Params::new();
    let (a, b, c) = tokio::join!(
      h.cache.get("posts/", &params, config),
      h.cache.get("posts/", &params, config),
      h.cache.get("posts/", &params, config),
    );

    assert_eq!(a.unwrap().data, json!({"results": [1]}));
    assert_eq!(b.unwrap().data, json!({"results": [1]}));
    assert_eq!(c.unwrap().data, json!({"results": [1]}));
    assert!(h.cache.flights.lock().unwrap().running.is_empty());
  }

  async fn mount_slow_then_fresh(server: &MockServer) {
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({"likes": 0}))
          .set_delay(std::time::Duration::from_millis(400)),
      )
      .up_to_n_times(1)
      .mount(server)
      .await;
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"likes": 1})))
      .mount(server)
      .await;
  }

  fn spawn_get(
    cache: &CacheLayer<SecureCacheStorage<MemoryStore>>,
  ) -> tokio::task::JoinHandle<ApiResult<CacheResult<Value>>> {
    let cache = cache.clone();
    tokio::spawn(async move { cache.get("posts/", &Params::new(), CacheConfig::ttl(60)).await })
  }

  #[tokio::test]
  async fn reads_after_a_mutation_never_see_an_older_fetch() {
    let h = harness().await;
    mount_slow_then_fresh(&h.server).await;
    Mock::given(method("POST"))
      .and(path("/posts/1/like/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
      .mount(&h.server)
      .await;

    let slow = spawn_get(&h.cache);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    h.cache
      .mutate(Request::post("posts/1/like/"), &["posts/"])
      .await
      .unwrap();
    let after = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();
    assert_eq!(after.data, json!({"likes": 1}));

    // The earlier caller still gets its own response, but it is not stored
    assert_eq!(slow.await.unwrap().unwrap().data, json!({"likes": 0}));

    let cached = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();
    assert!(cached.is_cached());
    assert_eq!(cached.data, json!({"likes": 1}));
  }

  #[tokio::test]
  async fn forced_refresh_does_not_join_a_running_fetch() {
    let h = harness().await;
    mount_slow_then_fresh(&h.server).await;

    let slow = spawn_get(&h.cache);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let forced = h
      .cache
      .get(
        "posts/",
        &Params::new(),
        CacheConfig::ttl(60).with_force_refresh(true),
      )
      .await
      .unwrap();
    assert_eq!(forced.data, json!({"likes": 1}));
    assert_eq!(slow.await.unwrap().unwrap().data, json!({"likes": 0}));

    let cached = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();
    assert_eq!(cached.data, json!({"likes": 1}));
    assert_eq!(request_count(&h.server).await, 2);
  }

  #[tokio::test]
  async fn entry_from_before_a_clock_rollback_is_refetched() {
    let h = harness().await;
    mount_posts(&h.server, json!({"results": []})).await;
    let start = h.clock.now();

    h.cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();
    h.clock.set(start - Duration::minutes(10));
    let again = h
      .cache
      .get("posts/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();

    assert!(!again.is_cached());
    assert_eq!(request_count(&h.server).await, 2);
  }

  #[tokio::test]
  async fn mutate_invalidates_listed_paths() {
    let h = harness().await;
    mount_posts(&h.server, json!([])).await;
    Mock::given(method("POST"))
      .and(path("/posts/12/like/"))
      .respond_with(ResponseTemplate::new(201).set_body_json(json!({"liked": true})))
      .mount(&h.server)
      .await;

    let page = Params::from([("page".to_string(), "2".to_string())]);
    h.cache.get("posts/", &Params::new(), CacheConfig::ttl(60)).await.unwrap();
    h.cache.get("posts/", &page, CacheConfig::ttl(60)).await.unwrap();
    assert_eq!(h.store.len(), 2);

    let result = h
      .cache
      .mutate(Request::post("posts/12/like/"), &["posts/"])
      .await
      .unwrap();

    assert_eq!(result, json!({"liked": true}));
    assert!(h.store.is_empty());
  }

  #[tokio::test]
  async fn failed_mutation_keeps_cache() {
    let h = harness().await;
    mount_posts(&h.server, json!([])).await;
    Mock::given(method("DELETE"))
      .and(path("/posts/12/"))
      .respond_with(
        ResponseTemplate::new(403).set_body_json(json!({"detail": "Not your post."})),
      )
      .mount(&h.server)
      .await;

    h.cache.get("posts/", &Params::new(), CacheConfig::ttl(60)).await.unwrap();
    let err = h
      .cache
      .mutate(Request::delete("posts/12/"), &["posts/"])
      .await
      .unwrap_err();

    assert_eq!(err.to_string(), "Not your post.");
    assert_eq!(h.store.len(), 1);
  }

  #[tokio::test]
  async fn invalidate_single_entry() {
    let h = harness().await;
    mount_posts(&h.server, json!([])).await;
    let page = Params::from([("page".to_string(), "2".to_string())]);
    h.cache.get("posts/", &Params::new(), CacheConfig::ttl(60)).await.unwrap();
    h.cache.get("posts/", &page, CacheConfig::ttl(60)).await.unwrap();

    h.cache.invalidate("posts/", &page).unwrap();

    assert_eq!(h.store.len(), 1);
    assert_eq!(h.cache.clear().unwrap(), 1);
  }

  #[tokio::test]
  async fn get_json_decodes_payload() {
    #[derive(serde::Deserialize)]
    struct Profile {
      username: String,
    }

    let h = harness().await;
    Mock::given(method("GET"))
      .and(path("/profiles/3/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "ana"})))
      .mount(&h.server)
      .await;

    let profile: CacheResult<Profile> = h
      .cache
      .get_json("profiles/3/", &Params::new(), CacheConfig::ttl(1))
      .await
      .unwrap();
    assert_eq!(profile.data.username, "ana");

    let err = h
      .cache
      .get_json::<Vec<u32>>("profiles/3/", &Params::new(), CacheConfig::ttl(1))
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::Decode(_)));
  }
}
