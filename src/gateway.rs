//! Gateway facade wiring session, dispatcher and cache together.

use color_eyre::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

use crate::api::{Dispatcher, Params, Request, TokenSource};
use crate::cache::{CacheConfig, CacheLayer, CacheResult, SecureCacheStorage};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::ApiResult;
use crate::pagination::{self, Aggregated, PageRequest};
use crate::session::{SessionStore, StoredToken, User};
use crate::store::{SecureStore, SqliteStore};

/// Entry point for every network call the application makes.
///
/// Owns one secure store shared by the session and the cache. Construct it
/// once at startup with [`Gateway::init`]; logging out or deleting the
/// account tears the cache down with the session.
pub struct Gateway<S: SecureStore> {
  session: SessionStore<S>,
  cache: CacheLayer<SecureCacheStorage<S>>,
  default_cache: CacheConfig,
}

impl<S: SecureStore> Clone for Gateway<S> {
  fn clone(&self) -> Self {
    Self {
      session: self.session.clone(),
      cache: self.cache.clone(),
      default_cache: self.default_cache,
    }
  }
}

impl Gateway<SqliteStore> {
  /// Open the on-disk store named by `config` (or the default location)
  /// and build a gateway on top of it.
  pub fn open(config: &Config) -> Result<Self> {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };

    Ok(Self::init(config, Arc::new(store))?)
  }
}

impl<S: SecureStore + 'static> Gateway<S> {
  pub fn init(config: &Config, store: Arc<S>) -> ApiResult<Self> {
    Self::with_clock(config, store, Arc::new(SystemClock))
  }

  pub fn with_clock(config: &Config, store: Arc<S>, clock: Arc<dyn Clock>) -> ApiResult<Self> {
    let tokens: Arc<dyn TokenSource> = Arc::new(StoredToken::new(Arc::clone(&store)));
    let dispatcher = Dispatcher::from_config(&config.api, config.retry, tokens)?;

    let session = SessionStore::new(Arc::clone(&store), dispatcher.clone());
    let cache = CacheLayer::new(SecureCacheStorage::new(store), dispatcher).with_clock(clock);

    Ok(Self {
      session,
      cache,
      default_cache: CacheConfig::ttl(config.cache.default_ttl_minutes),
    })
  }

  pub fn session(&self) -> &SessionStore<S> {
    &self.session
  }

  pub fn cache(&self) -> &CacheLayer<SecureCacheStorage<S>> {
    &self.cache
  }

  /// Cache policy used by callers that do not pick their own.
  pub fn default_cache(&self) -> CacheConfig {
    self.default_cache
  }

  /// Log in. Responses cached or still in flight for any earlier session
  /// are dropped first.
  pub async fn log_in(&self, username: &str, password: &str) -> ApiResult<User> {
    self.teardown()?;
    self.session.log_in(username, password).await
  }

  /// Log out and drop every cached response, even if the server call fails.
  pub async fn log_out(&self) -> ApiResult<()> {
    let remote = self.session.log_out().await;
    self.teardown()?;
    remote
  }

  pub async fn delete_account(&self, password: &str) -> ApiResult<()> {
    self.session.delete_account(password).await?;
    self.teardown()?;
    Ok(())
  }

  /// Forget the session after a 401 the caller decided is fatal.
  pub fn handle_auth_failure(&self) -> ApiResult<()> {
    self.session.handle_auth_failure()?;
    self.teardown()?;
    Ok(())
  }

  /// Drop all cached responses.
  pub fn teardown(&self) -> ApiResult<usize> {
    self.cache.clear()
  }

  pub async fn get(
    &self,
    path: &str,
    params: &Params,
    config: CacheConfig,
  ) -> ApiResult<CacheResult<Value>> {
    self.cache.get(path, params, config).await
  }

  pub async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    params: &Params,
    config: CacheConfig,
  ) -> ApiResult<CacheResult<T>> {
    self.cache.get_json(path, params, config).await
  }

  pub async fn fetch_all<T: DeserializeOwned>(
    &self,
    path: &str,
    params: &Params,
    config: CacheConfig,
    request: &PageRequest,
  ) -> ApiResult<Aggregated<T>> {
    pagination::fetch_all(&self.cache, path, params, config, request).await
  }

  /// Uncached write; on success the listed paths are invalidated.
  pub async fn mutate(&self, request: Request, invalidate: &[&str]) -> ApiResult<Value> {
    self.cache.mutate(request, invalidate).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ApiError;
  use crate::session::{SessionState, SESSION_KEY, USER_KEY};
  use crate::store::MemoryStore;
  use serde_json::json;
  use wiremock::matchers::{body_partial_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  async fn gateway(server: &MockServer) -> (Gateway<MemoryStore>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let config = Config::for_base_url(&server.uri());
    let gateway = Gateway::init(&config, Arc::clone(&store)).unwrap();
    (gateway, store)
  }

  async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
      .and(path("/auth/login/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "token": "t-123",
        "user": {"id": 7, "username": "ana", "is_verified": true}
      })))
      .mount(server)
      .await;
  }

  #[tokio::test]
  async fn cached_get_carries_the_session_token() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .and(header("authorization", "Token t-123"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
      .expect(1)
      .mount(&server)
      .await;

    let (gateway, _) = gateway(&server).await;
    gateway.log_in("ana", "pw").await.unwrap();

    let config = CacheConfig::ttl(5);
    let first = gateway.get("posts/", &Params::new(), config).await.unwrap();
    let second = gateway.get("posts/", &Params::new(), config).await.unwrap();

    assert!(!first.is_cached());
    assert!(second.is_cached());
  }

  #[tokio::test]
  async fn logout_clears_cache_even_when_server_fails() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
      .and(path("/posts/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/auth/logout/"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let (gateway, store) = gateway(&server).await;
    gateway.log_in("ana", "pw").await.unwrap();
    gateway
      .get("posts/", &Params::new(), CacheConfig::ttl(5))
      .await
      .unwrap();

    let err = gateway.log_out().await.unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert!(store.is_empty());
    assert_eq!(gateway.session().state().unwrap(), SessionState::LoggedOut);
  }

  #[tokio::test]
  async fn refused_account_deletion_keeps_everything() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
      .and(path("/auth/delete-account/"))
      .respond_with(
        ResponseTemplate::new(400).set_body_json(json!({"detail": "Incorrect password."})),
      )
      .mount(&server)
      .await;

    let (gateway, store) = gateway(&server).await;
    gateway.log_in("ana", "pw").await.unwrap();

    let err = gateway.delete_account("wrong").await.unwrap_err();

    assert_eq!(
      err,
      ApiError::Status {
        status: 400,
        detail: "Incorrect password.".into()
      }
    );
    assert_eq!(store.get(SESSION_KEY).unwrap().as_deref(), Some("t-123"));
    assert!(store.get(USER_KEY).unwrap().is_some());
  }

  #[tokio::test]
  async fn auth_failure_drops_session_and_cache() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
      .and(path("/me/"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7})))
      .mount(&server)
      .await;

    let (gateway, store) = gateway(&server).await;
    gateway.log_in("ana", "pw").await.unwrap();
    gateway
      .get("me/", &Params::new(), gateway.default_cache().with_ttl_minutes(10))
      .await
      .unwrap();

    gateway.handle_auth_failure().unwrap();

    assert!(store.is_empty());
  }

  #[tokio::test]
  async fn new_session_never_sees_the_previous_users_fetch() {
    let server = MockServer::start().await;
    for (username, token) in [("ana", "t-ana"), ("bo", "t-bo")] {
      Mock::given(method("POST"))
        .and(path("/auth/login/"))
        .and(body_partial_json(json!({"username": username})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
          "token": token,
          "user": {"id": 1, "username": username}
        })))
        .mount(&server)
        .await;
    }
    Mock::given(method("GET"))
      .and(path("/me/"))
      .and(header("authorization", "Token t-ana"))
      .respond_with(
        ResponseTemplate::new(200)
          .set_body_json(json!({"username": "ana"}))
          .set_delay(std::time::Duration::from_millis(400)),
      )
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/me/"))
      .and(header("authorization", "Token t-bo"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "bo"})))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(path("/auth/logout/"))
      .respond_with(ResponseTemplate::new(204))
      .mount(&server)
      .await;

    let (gateway, _) = gateway(&server).await;
    gateway.log_in("ana", "pw").await.unwrap();

    let pending = {
      let gateway = gateway.clone();
      tokio::spawn(async move {
        gateway
          .get("me/", &Params::new(), CacheConfig::ttl(60))
          .await
      })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    gateway.log_out().await.unwrap();
    gateway.log_in("bo", "pw").await.unwrap();

    let me = gateway
      .get("me/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();
    assert_eq!(me.data, json!({"username": "bo"}));

    assert_eq!(pending.await.unwrap().unwrap().data, json!({"username": "ana"}));
    let cached = gateway
      .get("me/", &Params::new(), CacheConfig::ttl(60))
      .await
      .unwrap();
    assert!(cached.is_cached());
    assert_eq!(cached.data, json!({"username": "bo"}));
  }
}
