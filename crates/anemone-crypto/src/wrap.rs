//! Wrapping of short in-memory secrets under a passphrase-derived key
//!
//! Wrapped format: `[12-byte nonce][ciphertext + 16-byte tag]`

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::derive_wrapping_key;
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt `secret` under the key derived from `passphrase`.
pub fn wrap_secret(secret: &[u8], passphrase: &SecretString) -> CryptoResult<Vec<u8>> {
    let key = derive_wrapping_key(passphrase);
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, secret)
        .map_err(|_| CryptoError::Authentication)?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt the output of [`wrap_secret`].
pub fn unwrap_secret(
    wrapped: &[u8],
    passphrase: &SecretString,
) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if wrapped.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Authentication);
    }

    let key = derive_wrapping_key(passphrase);
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Authentication)
}

/// Encrypt an SMB restoration password under the master key.
pub fn encrypt_password(password: &str, master_key: &SecretString) -> CryptoResult<Vec<u8>> {
    use secrecy::ExposeSecret;

    if password.is_empty() {
        return Err(CryptoError::InvalidInput("password cannot be empty"));
    }
    if master_key.expose_secret().is_empty() {
        return Err(CryptoError::InvalidInput("master key cannot be empty"));
    }
    wrap_secret(password.as_bytes(), master_key)
}

/// Recover an SMB restoration password wrapped by [`encrypt_password`].
pub fn decrypt_password(
    encrypted: &[u8],
    master_key: &SecretString,
) -> CryptoResult<SecretString> {
    use secrecy::ExposeSecret;

    if encrypted.is_empty() {
        return Err(CryptoError::InvalidInput("encrypted password cannot be empty"));
    }
    if master_key.expose_secret().is_empty() {
        return Err(CryptoError::InvalidInput("master key cannot be empty"));
    }

    let plaintext = unwrap_secret(encrypted, master_key)?;
    let password = std::str::from_utf8(&plaintext)
        .map_err(|_| CryptoError::Encoding("password is not valid UTF-8".into()))?;
    Ok(SecretString::from(password.to_string()))
}
