//! SQLite-backed secure store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::cipher::Cipher;
use super::SecureStore;

/// Key-value store in a single SQLite table. Every value is sealed with the
/// store's [`Cipher`] before it touches disk.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  cipher: Cipher,
}

impl SqliteStore {
  /// Open the store at the default location, creating its key on first use.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open the store at `path`. The key lives next to it as `<path>.key`
  /// unless `FEEDGATE_STORE_KEY` is set.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let cipher = Cipher::load_or_create(&path.with_extension("key"))?;
    Self::open_with_cipher(path, cipher)
  }

  pub fn open_with_cipher(path: &Path, cipher: Cipher) -> Result<Self> {
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn, cipher)
  }

  /// Store that lives only as long as the process.
  pub fn open_in_memory(cipher: Cipher) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;

    Self::from_connection(conn, cipher)
  }

  fn from_connection(conn: Connection, cipher: Cipher) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      cipher,
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("feedgate").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SecureStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let sealed: Option<String> = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read key {}: {}", key, e))?;

    sealed.map(|s| self.cipher.open(&s)).transpose()
  }

  fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match value {
      Some(value) => {
        let sealed = self.cipher.seal(value)?;
        conn
          .execute(
            "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
            params![key, sealed],
          )
          .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;
      }
      None => {
        conn
          .execute("DELETE FROM kv WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete key {}: {}", key, e))?;
      }
    }

    Ok(())
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // substr avoids LIKE wildcard escaping
    let removed = conn
      .execute(
        "DELETE FROM kv WHERE substr(key, 1, ?) = ?",
        params![prefix.chars().count() as i64, prefix],
      )
      .map_err(|e| eyre!("Failed to delete keys under {}: {}", prefix, e))?;

    Ok(removed)
  }
}
