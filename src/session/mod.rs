//! Session lifecycle on top of the secure store.
//!
//! The token and the cached user live under two independent keys. They are
//! written one after the other, not in a transaction, so readers may briefly
//! see one updated without the other.

mod types;

pub use types::User;

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{Dispatcher, Request, TokenSource};
use crate::error::{ApiError, ApiResult};
use crate::store::SecureStore;
use types::{DeleteAccountRequest, LoginRequest, LoginResponse};

/// Store key holding the raw session token.
pub const SESSION_KEY: &str = "session";
/// Store key holding the JSON-encoded cached user.
pub const USER_KEY: &str = "user";

const LOGIN_PATH: &str = "auth/login/";
const LOGOUT_PATH: &str = "auth/logout/";
const DELETE_ACCOUNT_PATH: &str = "auth/delete-account/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  LoggedOut,
  LoggedIn,
}

/// Reads the session token straight from the secure store on every call.
pub struct StoredToken<S: SecureStore> {
  store: Arc<S>,
}

impl<S: SecureStore> StoredToken<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }
}

impl<S: SecureStore> TokenSource for StoredToken<S> {
  fn token(&self) -> color_eyre::Result<Option<String>> {
    self.store.get(SESSION_KEY)
  }
}

/// Owner of the session token and the cached user.
pub struct SessionStore<S: SecureStore> {
  store: Arc<S>,
  dispatcher: Dispatcher,
}

impl<S: SecureStore> Clone for SessionStore<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      dispatcher: self.dispatcher.clone(),
    }
  }
}

impl<S: SecureStore> SessionStore<S> {
  pub fn new(store: Arc<S>, dispatcher: Dispatcher) -> Self {
    Self { store, dispatcher }
  }

  pub fn token(&self) -> ApiResult<Option<String>> {
    self.store.get(SESSION_KEY).map_err(ApiError::storage)
  }

  pub fn user(&self) -> ApiResult<Option<User>> {
    let Some(raw) = self.store.get(USER_KEY).map_err(ApiError::storage)? else {
      return Ok(None);
    };

    serde_json::from_str(&raw)
      .map(Some)
      .map_err(|e| ApiError::Storage(format!("cached user is corrupt: {}", e)))
  }

  pub fn state(&self) -> ApiResult<SessionState> {
    Ok(match self.token()? {
      Some(_) => SessionState::LoggedIn,
      None => SessionState::LoggedOut,
    })
  }

  /// Log in and persist the new token and user.
  ///
  /// Any stale token is dropped before the request goes out, and the login
  /// call itself never carries an `Authorization` header. On failure the
  /// device stays logged out and the server's error is returned.
  pub async fn log_in(&self, username: &str, password: &str) -> ApiResult<User> {
    self.set(SESSION_KEY, None)?;

    let request = Request::post(LOGIN_PATH)
      .without_auth()
      .with_body(to_body(&LoginRequest { username, password })?);

    let response: LoginResponse = match self.dispatcher.send(&request).await {
      Ok(body) => serde_json::from_value(body).map_err(|e| ApiError::Decode(e.to_string()))?,
      Err(err) => {
        warn!(username, error = %err, "login failed");
        return Err(err);
      }
    };

    self.set(SESSION_KEY, Some(&response.token))?;
    self.store_user(&response.user)?;

    info!(username = %response.user.username, "logged in");
    Ok(response.user)
  }

  /// Log out locally, telling the server on a best-effort basis.
  ///
  /// Local state is cleared whatever the server says. The server's error,
  /// if any, is returned after that so callers can report it.
  pub async fn log_out(&self) -> ApiResult<()> {
    let remote = match self.token() {
      Ok(None) => Ok(()),
      // Try the server even if the token could not be read; the local
      // clear below is what matters.
      _ => self
        .dispatcher
        .send(&Request::post(LOGOUT_PATH))
        .await
        .map(drop),
    };

    if let Err(err) = &remote {
      warn!(error = %err, "server-side logout failed, clearing local session anyway");
    }

    self.clear()?;
    info!("logged out");
    remote
  }

  /// Delete the account on the server, then clear local state.
  ///
  /// Requires a logged-in user. If the server refuses, nothing local
  /// changes.
  pub async fn delete_account(&self, password: &str) -> ApiResult<()> {
    let user = self.user()?.ok_or(ApiError::NotLoggedIn)?;

    let request =
      Request::post(DELETE_ACCOUNT_PATH).with_body(to_body(&DeleteAccountRequest { password })?);
    self.dispatcher.send(&request).await?;

    self.clear()?;
    info!(username = %user.username, "account deleted");
    Ok(())
  }

  /// Patch the cached user's verification flag. Local only.
  pub fn set_user_verify(&self, verified: bool) -> ApiResult<User> {
    let mut user = self.user()?.ok_or(ApiError::NotLoggedIn)?;
    user.is_verified = verified;
    self.store_user(&user)?;
    Ok(user)
  }

  /// Drop the session after the caller decided a 401 means it is dead.
  pub fn handle_auth_failure(&self) -> ApiResult<()> {
    warn!("session rejected by server, logging out locally");
    self.clear()
  }

  fn store_user(&self, user: &User) -> ApiResult<()> {
    let raw = serde_json::to_string(user).map_err(|e| ApiError::Decode(e.to_string()))?;
    self.set(USER_KEY, Some(&raw))
  }

  /// Clear token and user, attempting both even if the first fails.
  fn clear(&self) -> ApiResult<()> {
    let token = self.set(SESSION_KEY, None);
    let user = self.set(USER_KEY, None);
    token.and(user)
  }

  fn set(&self, key: &str, value: Option<&str>) -> ApiResult<()> {
    self.store.set(key, value).map_err(ApiError::storage)
  }
}

fn to_body(body: &impl Serialize) -> ApiResult<Value> {
  serde_json::to_value(body).map_err(|e| ApiError::Decode(e.to_string()))
}
