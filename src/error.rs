//! Error type shared by every gateway operation.

use serde::Deserialize;
use thiserror::Error;

/// Errors surfaced to gateway callers.
///
/// Cloneable so that one failed network fetch can be handed to every caller
/// coalesced onto it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
  /// No response was received (connect failure, timeout, TLS).
  #[error("network request failed: {0}")]
  Transport(String),

  /// The server answered with a non-success status.
  #[error("{detail}")]
  Status { status: u16, detail: String },

  /// The response body did not have the expected shape.
  #[error("unexpected response body: {0}")]
  Decode(String),

  /// The secure store failed while reading or writing session state.
  #[error("secure storage error: {0}")]
  Storage(String),

  #[error("no user is logged in")]
  NotLoggedIn,

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error body returned by the backend, e.g. `{"detail": "Not found."}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
  detail: Option<String>,
  #[serde(default)]
  non_field_errors: Vec<String>,
}

impl ApiError {
  /// Build a status error from a raw response body.
  ///
  /// Prefers the server's `detail` field, then the first form-level error,
  /// then the raw text, then the canonical reason phrase.
  pub fn from_response(status: u16, body: &[u8]) -> Self {
    let detail = serde_json::from_slice::<ErrorBody>(body)
      .ok()
      .and_then(|b| b.detail.or_else(|| b.non_field_errors.into_iter().next()))
      .or_else(|| {
        let text = String::from_utf8_lossy(body).trim().to_string();
        (!text.is_empty() && !text.starts_with('<')).then_some(text)
      })
      .unwrap_or_else(|| {
        reqwest::StatusCode::from_u16(status)
          .ok()
          .and_then(|s| s.canonical_reason())
          .unwrap_or("request failed")
          .to_string()
      });

    Self::Status { status, detail }
  }

  pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
    Self::Storage(err.to_string())
  }

  /// HTTP status code, when the server produced one.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// True for 401 responses. The gateway never acts on this itself.
  pub fn is_unauthorized(&self) -> bool {
    self.status() == Some(401)
  }

  pub fn is_transport(&self) -> bool {
    matches!(self, Self::Transport(_))
  }
}
