//! Symmetric encryption for config values and stored credentials.
//!
//! AES-256-GCM with one process-wide key loaded from `ENCRYPTION_KEY`.
//! Ciphertext is `BASE64(nonce || ciphertext)` with a random 96-bit nonce,
//! so encrypting the same plaintext twice yields different strings.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use thiserror::Error;

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
const NONCE_LENGTH: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid key or corrupted data")]
    DecryptionFailed,
}

/// Process-wide cipher. Cheap to clone.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_LENGTH],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}

impl Cipher {
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Parse a key from hex (64 characters) or base64 format.
    pub fn from_key_str(key_str: &str) -> Result<Self, CryptoError> {
        let trimmed = key_str.trim();

        if trimmed.len() == KEY_LENGTH * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes = hex::decode(trimmed).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let mut key = [0u8; KEY_LENGTH];
            key.copy_from_slice(&bytes);
            return Ok(Self::new(key));
        }

        let bytes = BASE64
            .decode(trimmed)
            .map_err(|_| CryptoError::InvalidKey("key is neither valid hex nor base64".into()))?;
        if bytes.len() != KEY_LENGTH {
            return Err(CryptoError::InvalidKey(format!(
                "key must be {} bytes, got {} bytes",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(Self::new(key))
    }

    /// Generate a cipher with a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }

    /// Hex form of the key, suitable for `ENCRYPTION_KEY`.
    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    fn aead(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .aead()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let combined = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;
        if combined.len() < NONCE_LENGTH {
            return Err(CryptoError::InvalidCiphertext("value too short".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let plaintext = self
            .aead()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::InvalidCiphertext("plaintext is not valid UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Cipher {
        let mut key = [0u8; KEY_LENGTH];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Cipher::new(key)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let encrypted = cipher.encrypt("sk-live-12345").unwrap();
        assert_ne!(encrypted, "sk-live-12345");
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "sk-live-12345");
    }

    #[test]
    fn test_nonce_is_random() {
        let cipher = test_cipher();
        assert_ne!(cipher.encrypt("same").unwrap(), cipher.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = test_cipher().encrypt("secret").unwrap();
        let other = Cipher::generate();
        assert!(matches!(
            other.decrypt(&encrypted),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_garbage_ciphertext() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.decrypt("not base64!!"),
            Err(CryptoError::InvalidCiphertext(_))
        ));
        assert!(matches!(
            cipher.decrypt("AAAA"),
            Err(CryptoError::InvalidCiphertext(_))
        ));
    }

    #[test]
    fn test_key_parsing() {
        let cipher = test_cipher();
        let from_hex = Cipher::from_key_str(&cipher.key_hex()).unwrap();
        assert_eq!(from_hex.key, cipher.key);

        let from_b64 = Cipher::from_key_str(&BASE64.encode(cipher.key)).unwrap();
        assert_eq!(from_b64.key, cipher.key);

        assert!(Cipher::from_key_str("short").is_err());
        assert!(Cipher::from_key_str(&BASE64.encode([1u8; 16])).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", test_cipher());
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("0, 1, 2"));
    }
}
