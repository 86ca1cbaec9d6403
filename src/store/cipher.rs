//! Authenticated encryption for values at rest.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use color_eyre::{eyre::eyre, Result};
use rand::RngCore;
use std::fmt;
use std::path::Path;

/// Environment variable holding a base64-encoded 32-byte store key.
pub const KEY_ENV: &str = "FEEDGATE_STORE_KEY";

const ENVELOPE_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 sealing of stored values.
///
/// Sealed values look like `enc:v1:<nonce>:<ciphertext>`, both parts
/// base64url without padding.
#[derive(Clone)]
pub struct Cipher {
  key: [u8; 32],
}

impl Cipher {
  pub fn from_key(key: [u8; 32]) -> Self {
    Self { key }
  }

  /// Fresh random key.
  pub fn generate() -> Self {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    Self { key }
  }

  /// Decode a key from base64 (url-safe or standard alphabet).
  pub fn from_base64(encoded: &str) -> Result<Self> {
    let encoded = encoded.trim();
    let bytes = URL_SAFE_NO_PAD
      .decode(encoded.as_bytes())
      .or_else(|_| STANDARD.decode(encoded.as_bytes()))
      .map_err(|e| eyre!("Store key is not valid base64: {}", e))?;

    let key: [u8; 32] = bytes
      .as_slice()
      .try_into()
      .map_err(|_| eyre!("Store key must be 32 bytes, got {}", bytes.len()))?;

    Ok(Self { key })
  }

  pub fn to_base64(&self) -> String {
    URL_SAFE_NO_PAD.encode(self.key)
  }

  /// Resolve the store key.
  ///
  /// Order:
  /// 1. `FEEDGATE_STORE_KEY` environment variable
  /// 2. Existing key file at `key_path`
  /// 3. New random key, written to `key_path`
  pub fn load_or_create(key_path: &Path) -> Result<Self> {
    if let Ok(encoded) = std::env::var(KEY_ENV) {
      if !encoded.trim().is_empty() {
        return Self::from_base64(&encoded);
      }
    }

    if key_path.exists() {
      let encoded = std::fs::read_to_string(key_path)
        .map_err(|e| eyre!("Failed to read store key {}: {}", key_path.display(), e))?;
      return Self::from_base64(&encoded);
    }

    let cipher = Self::generate();
    write_key_file(key_path, &cipher.to_base64())?;
    tracing::info!(path = %key_path.display(), "generated new store key");
    Ok(cipher)
  }

  pub fn seal(&self, plaintext: &str) -> Result<String> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = self
      .aead()?
      .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
      .map_err(|e| eyre!("Failed to encrypt value: {}", e))?;

    Ok(format!(
      "{}{}:{}",
      ENVELOPE_PREFIX,
      URL_SAFE_NO_PAD.encode(nonce_bytes),
      URL_SAFE_NO_PAD.encode(ciphertext)
    ))
  }

  pub fn open(&self, sealed: &str) -> Result<String> {
    let (nonce_b64, ciphertext_b64) = sealed
      .strip_prefix(ENVELOPE_PREFIX)
      .and_then(|rest| rest.split_once(':'))
      .ok_or_else(|| eyre!("Stored value is not a valid envelope"))?;

    let nonce = URL_SAFE_NO_PAD
      .decode(nonce_b64.as_bytes())
      .map_err(|e| eyre!("Failed to decode nonce: {}", e))?;
    if nonce.len() != NONCE_LEN {
      return Err(eyre!("Stored nonce has invalid length {}", nonce.len()));
    }
    let ciphertext = URL_SAFE_NO_PAD
      .decode(ciphertext_b64.as_bytes())
      .map_err(|e| eyre!("Failed to decode ciphertext: {}", e))?;

    let plaintext = self
      .aead()?
      .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
      .map_err(|_| eyre!("Failed to decrypt value (wrong key or tampered data)"))?;

    String::from_utf8(plaintext).map_err(|e| eyre!("Decrypted value is not UTF-8: {}", e))
  }

  fn aead(&self) -> Result<ChaCha20Poly1305> {
    ChaCha20Poly1305::new_from_slice(&self.key).map_err(|e| eyre!("Invalid store key: {}", e))
  }
}

impl fmt::Debug for Cipher {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cipher").field("key", &"<redacted>").finish()
  }
}

fn write_key_file(path: &Path, encoded: &str) -> Result<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create key directory: {}", e))?;
  }

  std::fs::write(path, encoded)
    .map_err(|e| eyre!("Failed to write store key {}: {}", path.display(), e))?;

  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
      .map_err(|e| eyre!("Failed to restrict store key permissions: {}", e))?;
  }

  Ok(())
}
