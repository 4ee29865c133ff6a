//! Key hierarchy: per-user data keys wrapped under the master key
//!
//! At rest a data key is its base64 text, wrapped with [`wrap_secret`] and
//! base64-encoded again, stored next to a verification hash of the base64
//! text. Peers running the same format can unwrap each other's backups
//! given the same master key.

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::RngCore;
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::wrap::{unwrap_secret, wrap_secret};
use crate::KEY_SIZE;

/// A per-user 256-bit data key. Zeroized on drop.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from a slice, rejecting any length other than [`KEY_SIZE`].
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self::from_bytes(key))
    }

    /// Decode the at-rest base64 form.
    pub fn from_base64(text: &str) -> CryptoResult<Self> {
        let decoded = Zeroizing::new(
            B64.decode(text.trim())
                .map_err(|e| CryptoError::Encoding(format!("data key is not base64: {e}")))?,
        );
        Self::from_slice(&decoded)
    }

    /// The at-rest base64 form.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(B64.encode(self.bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The persisted form of a data key: what a user record stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDataKey {
    /// base64 of `[nonce][ciphertext + tag]`
    pub encrypted: String,
    /// base64 SHA-256 of the key's base64 text
    pub hash: String,
}

impl WrappedDataKey {
    /// Generate a fresh data key and its persisted form.
    pub fn generate(master_key: &SecretString) -> CryptoResult<(DataKey, Self)> {
        let key = generate_data_key();
        let wrapped = Self {
            encrypted: wrap_data_key(&key, master_key)?,
            hash: key_verification_hash(&key),
        };
        Ok((key, wrapped))
    }
}

/// Generate a random 256-bit data key.
pub fn generate_data_key() -> DataKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    DataKey::from_bytes(bytes)
}

/// Verification hash stored alongside the wrapped key.
pub fn key_verification_hash(key: &DataKey) -> String {
    let text = key.to_base64();
    B64.encode(Sha256::digest(text.as_bytes()))
}

/// Check an unwrapped key against its stored verification hash.
pub fn verify_data_key(key: &DataKey, expected_hash: &str) -> bool {
    let actual = key_verification_hash(key);
    // Length is public (fixed-size digest); compare without early exit.
    actual.len() == expected_hash.len()
        && actual
            .bytes()
            .zip(expected_hash.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Wrap a data key under the master key.
pub fn wrap_data_key(key: &DataKey, master_key: &SecretString) -> CryptoResult<String> {
    let text = key.to_base64();
    let wrapped = wrap_secret(text.as_bytes(), master_key)?;
    Ok(B64.encode(wrapped))
}

/// Unwrap a data key stored by [`wrap_data_key`].
pub fn unwrap_data_key(wrapped: &str, master_key: &SecretString) -> CryptoResult<DataKey> {
    let raw = B64
        .decode(wrapped.trim())
        .map_err(|e| CryptoError::Encoding(format!("wrapped key is not base64: {e}")))?;
    let text = unwrap_secret(&raw, master_key)?;
    let text = std::str::from_utf8(&text)
        .map_err(|_| CryptoError::Encoding("unwrapped key is not UTF-8".into()))?;
    DataKey::from_base64(text)
}

/// Re-encrypt a wrapped data key under a new master key.
pub fn rewrap_data_key(
    wrapped: &str,
    old_master: &SecretString,
    new_master: &SecretString,
) -> CryptoResult<String> {
    let key = unwrap_data_key(wrapped, old_master)?;
    wrap_data_key(&key, new_master)
}
