//! Retry and backoff policy for outgoing requests.

use rand::Rng;
use reqwest::Method;
use serde::Deserialize;
use std::time::Duration;

use crate::error::ApiError;

/// Bounded retry with exponential backoff and full jitter.
///
/// The default performs no retries: a failed request is reported to the
/// caller straight away. Only transport failures and gateway-class statuses
/// (502, 503, 504) on idempotent methods are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 0,
      base_delay_ms: 200,
      max_delay_ms: 5_000,
    }
  }
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self::default()
  }

  pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_retries,
      base_delay_ms: base_delay.as_millis() as u64,
      max_delay_ms: max_delay.as_millis() as u64,
    }
  }

  /// Upper bound for the wait before retry number `attempt` (0-based).
  pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let millis = self
      .base_delay_ms
      .saturating_mul(factor)
      .min(self.max_delay_ms);
    Duration::from_millis(millis)
  }

  /// Random wait in `[0, backoff_ceiling(attempt)]`.
  pub fn delay(&self, attempt: u32) -> Duration {
    let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
  }

  pub fn should_retry(&self, attempt: u32, method: &Method, err: &ApiError) -> bool {
    if attempt >= self.max_retries || !is_idempotent(method) {
      return false;
    }

    match err {
      ApiError::Transport(_) => true,
      ApiError::Status { status, .. } => matches!(status, 502..=504),
      _ => false,
    }
  }
}

fn is_idempotent(method: &Method) -> bool {
  matches!(
    *method,
    Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
  )
}
