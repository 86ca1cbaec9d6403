//! Secure key-value storage for session state and cached responses.
//!
//! Values are opaque strings; callers encode structured data themselves.
//! Setting a key to `None` deletes it. Errors are always returned to the
//! caller, never swallowed.

mod cipher;
mod memory;
mod sqlite;

pub use cipher::Cipher;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use color_eyre::Result;
use std::sync::Arc;

/// Durable string storage, encrypted at rest where the backend supports it.
pub trait SecureStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, or delete the key when `value` is `None`.
  fn set(&self, key: &str, value: Option<&str>) -> Result<()>;

  /// Delete every key starting with `prefix`, returning how many were removed.
  fn remove_prefix(&self, prefix: &str) -> Result<usize>;
}

impl<S: SecureStore + ?Sized> SecureStore for Arc<S> {
  fn get(&self, key: &str) -> Result<Option<String>> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
    (**self).set(key, value)
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    (**self).remove_prefix(prefix)
  }
}
