//! Token encryption at rest
//!
//! AES-256-GCM with a fresh random 12-byte nonce per value. The stored form
//! is `base64(nonce || ciphertext)`, so each record is a plain string that
//! any key-value area can hold.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use rand::RngExt;

use crate::error::{Error, Result};

/// Required key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

/// Encrypts and decrypts individual credential records.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher").field("key", &"[REDACTED]").finish()
    }
}

impl TokenCipher {
    /// Build a cipher from a 32-byte key.
    pub fn new(key: &Secret<Vec<u8>>) -> Result<Self> {
        if key.expose().len() != KEY_LEN {
            return Err(Error::Crypto(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key.expose().len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key.expose())
            .map_err(|e| Error::Crypto(format!("creating cipher: {e}")))?;
        Ok(Self { cipher })
    }

    /// Generate a random key. Credentials encrypted with it are unreadable
    /// once the key is dropped.
    pub fn generate_key() -> Secret<Vec<u8>> {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill(&mut key);
        Secret::new(key.to_vec())
    }

    /// Decode a base64 key (as supplied through the environment or a key file).
    pub fn key_from_base64(encoded: &str) -> Result<Secret<Vec<u8>>> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Crypto(format!("decoding key: {e}")))?;
        if key.len() != KEY_LEN {
            return Err(Error::Crypto(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Secret::new(key))
    }

    /// Encrypt a value into its stored string form.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload))
    }

    /// Decrypt a stored value. Fails on bad base64, truncated payloads,
    /// tampered ciphertext, or a different key.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let payload = STANDARD
            .decode(stored)
            .map_err(|e| Error::Crypto(format!("decoding ciphertext: {e}")))?;
        if payload.len() <= NONCE_LEN {
            return Err(Error::Crypto("ciphertext too short".into()));
        }

        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("decrypted value is not UTF-8: {e}")))
    }
}
