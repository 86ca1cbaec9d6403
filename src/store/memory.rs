//! In-process store, used for tests and throwaway sessions.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::SecureStore;

/// Map-backed store. Nothing is persisted or encrypted.
#[derive(Debug, Default)]
pub struct MemoryStore {
  values: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Copy of every stored key and value.
  pub fn snapshot(&self) -> BTreeMap<String, String> {
    self
      .values
      .read()
      .map(|values| values.clone())
      .unwrap_or_default()
  }

  pub fn len(&self) -> usize {
    self.values.read().map(|v| v.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl SecureStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let values = self
      .values
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(values.get(key).cloned())
  }

  fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
    let mut values = self
      .values
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match value {
      Some(value) => values.insert(key.to_string(), value.to_string()),
      None => values.remove(key),
    };

    Ok(())
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    let mut values = self
      .values
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let before = values.len();
    values.retain(|key, _| !key.starts_with(prefix));
    Ok(before - values.len())
  }
}
