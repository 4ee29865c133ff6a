//! Key derivation: master key passphrase → 256-bit wrapping key
//!
//! A single SHA-256 pass. This only turns an arbitrary-length, high-entropy
//! installation secret into a fixed-size AEAD key; it is not a password KDF
//! and must never gate a human login (see [`crate::password`]).

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit key derived from a passphrase, used only for wrapping short secrets.
///
/// Zeroized on drop.
#[derive(Clone)]
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the wrapping key for a passphrase. Deterministic.
pub fn derive_wrapping_key(passphrase: &SecretString) -> WrappingKey {
    let digest = Sha256::digest(passphrase.expose_secret().as_bytes());
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&digest);
    WrappingKey::from_bytes(bytes)
}
