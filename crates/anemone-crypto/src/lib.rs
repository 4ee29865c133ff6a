//! anemone-crypto: encryption codec for share content leaving an instance
//!
//! Stream format (single unit):
//! ```text
//! [12 bytes: random nonce][N bytes: AES-256-GCM ciphertext][16 bytes: tag]
//! ```
//!
//! Chunked stream format (large files):
//! ```text
//! "AECG" | u32 BE version (2) | { u8 final | u32 BE ciphertext_len | 12-byte nonce | ciphertext + tag }*
//! ```
//!
//! Each frame's AAD is its index (u64 BE) followed by the `final` byte; the
//! stream must end with exactly one final frame.
//!
//! Key hierarchy:
//! ```text
//! Master key (installation-wide passphrase, system configuration store)
//!   └── SHA-256 → wrapping key
//!         ├── Data key (per-user, 256-bit random, stored wrapped + verification hash)
//!         │     └── stream AEAD over manifests and file contents
//!         └── SMB restoration passwords (wrapped)
//! ```
//!
//! Human login passwords never touch this hierarchy: they are hashed with
//! Argon2id in [`password`].

pub mod error;
pub mod kdf;
pub mod keys;
pub mod password;
pub mod stream;
pub mod wrap;

pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_wrapping_key, WrappingKey};
pub use keys::{
    generate_data_key, key_verification_hash, rewrap_data_key, unwrap_data_key, verify_data_key,
    wrap_data_key, DataKey, WrappedDataKey,
};
pub use password::{hash_password, verify_password};
pub use stream::{
    decrypt_bytes, decrypt_file, decrypt_stream, encrypt_bytes, encrypt_file, encrypt_stream,
    encrypt_stream_chunked,
};
pub use wrap::{decrypt_password, encrypt_password, unwrap_secret, wrap_secret};

/// Size of a data or wrapping key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Magic prefix of the chunked stream format
pub const CHUNK_MAGIC: &[u8; 4] = b"AECG";

/// Version written after the chunked magic
pub const CHUNK_FORMAT_VERSION: u32 = 2;

/// Default plaintext chunk size for the chunked format (128 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024 * 1024;
