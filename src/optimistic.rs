//! Optimistic updates: apply locally, confirm remotely, roll back on failure.

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Run one optimistic mutation.
///
/// `update_ui` runs before `api_call` is started, so local state shows the
/// intended result immediately. If the call succeeds its result is returned
/// and the local change stays. If it fails, `rollback_ui` runs and the error
/// is returned.
///
/// `rollback_ui` must be idempotent and must not assume the state is still
/// exactly what `update_ui` left. [`VersionedState::run`] enforces that
/// for state it owns.
pub async fn run<T, E, U, F, Fut, R>(update_ui: U, api_call: F, rollback_ui: R) -> Result<T, E>
where
  U: FnOnce(),
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  R: FnOnce(),
  E: Display,
{
  update_ui();

  match api_call().await {
    Ok(value) => Ok(value),
    Err(err) => {
      warn!(error = %err, "optimistic update failed, rolling back");
      rollback_ui();
      Err(err)
    }
  }
}

#[derive(Debug)]
struct Versioned<T> {
  version: u64,
  value: T,
}

/// Shared state where every mutation bumps a version.
///
/// A failed optimistic mutation is only rolled back if no other mutation
/// landed after it; otherwise the newer state is kept.
#[derive(Debug)]
pub struct VersionedState<T> {
  inner: Arc<Mutex<Versioned<T>>>,
}

impl<T> Clone for VersionedState<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone> VersionedState<T> {
  pub fn new(value: T) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Versioned { version: 0, value })),
    }
  }

  pub fn get(&self) -> T {
    self.lock().value.clone()
  }

  pub fn version(&self) -> u64 {
    self.lock().version
  }

  /// Apply a local mutation, returning the new version.
  pub fn update(&self, f: impl FnOnce(&mut T)) -> u64 {
    let mut inner = self.lock();
    f(&mut inner.value);
    inner.version += 1;
    inner.version
  }

  /// Optimistically apply `apply`, then await `api_call`.
  ///
  /// On failure the pre-apply value is restored only if the state is still
  /// at the version this mutation produced.
  pub async fn run<R, E, F, Fut>(&self, apply: impl FnOnce(&mut T), api_call: F) -> Result<R, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Display,
  {
    let (previous, stamped) = {
      let mut inner = self.lock();
      let previous = inner.value.clone();
      apply(&mut inner.value);
      inner.version += 1;
      (previous, inner.version)
    };

    match api_call().await {
      Ok(value) => Ok(value),
      Err(err) => {
        if self.rollback_if_current(stamped, previous) {
          warn!(error = %err, version = stamped, "optimistic update failed, rolled back");
        } else {
          debug!(
            error = %err,
            version = stamped,
            "optimistic update failed, newer state kept"
          );
        }
        Err(err)
      }
    }
  }

  fn rollback_if_current(&self, version: u64, previous: T) -> bool {
    let mut inner = self.lock();
    if inner.version != version {
      return false;
    }
    inner.value = previous;
    inner.version += 1;
    true
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Versioned<T>> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
}
