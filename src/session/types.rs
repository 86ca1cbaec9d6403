//! Serde types for the auth endpoints and the cached user projection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The logged-in user as cached on the device.
///
/// Fields the gateway does not use are kept in `extra` so the cached copy
/// round-trips whatever the server sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  #[serde(default)]
  pub id: u64,
  pub username: String,
  #[serde(default)]
  pub email: Option<String>,
  #[serde(default)]
  pub is_verified: bool,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub(super) struct LoginRequest<'a> {
  pub username: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct LoginResponse {
  pub token: String,
  pub user: User,
}

#[derive(Debug, Serialize)]
pub(super) struct DeleteAccountRequest<'a> {
  pub password: &'a str,
}
