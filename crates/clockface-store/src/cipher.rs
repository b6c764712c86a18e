//! AES-256-GCM sealing for embedding vectors at rest.

use crate::DbError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
}

impl EmbeddingCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(key_hex: &str) -> Result<Self, DbError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| DbError::Crypto(format!("embedding key is not valid hex: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            DbError::Crypto(format!("embedding key is {} bytes, expected {KEY_LEN}", b.len()))
        })?;
        Ok(Self::new(&key))
    }

    /// Encrypt under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN]), DbError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| DbError::Crypto(format!("AES-GCM encrypt: {e}")))?;
        Ok((ciphertext, nonce))
    }

    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, DbError> {
        if nonce.len() != NONCE_LEN {
            return Err(DbError::InvalidDbValue(format!(
                "embedding nonce is {} bytes",
                nonce.len()
            )));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| DbError::Crypto(format!("AES-GCM decrypt: {e}")))
    }
}

impl fmt::Debug for EmbeddingCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EmbeddingCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_seal_then_open() {
        let cipher = EmbeddingCipher::from_hex(KEY_HEX).unwrap();
        let (sealed, nonce) = cipher.seal(b"embedding bytes").unwrap();
        assert_ne!(sealed.as_slice(), b"embedding bytes");
        assert_eq!(cipher.open(&nonce, &sealed).unwrap(), b"embedding bytes");
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher = EmbeddingCipher::from_hex(KEY_HEX).unwrap();
        let other = EmbeddingCipher::new(&[7u8; KEY_LEN]);
        let (sealed, nonce) = cipher.seal(b"secret").unwrap();
        assert!(matches!(other.open(&nonce, &sealed), Err(DbError::Crypto(_))));
    }

    #[test]
    fn test_bad_keys_rejected() {
        assert!(EmbeddingCipher::from_hex("zz").is_err());
        assert!(EmbeddingCipher::from_hex("abc").is_err());
        assert!(EmbeddingCipher::from_hex("0011").is_err());
    }

    #[test]
    fn test_signed_hex_pairs_rejected() {
        assert!(matches!(
            EmbeddingCipher::from_hex(&"+0".repeat(KEY_LEN)),
            Err(DbError::Crypto(_))
        ));
        assert!(EmbeddingCipher::from_hex(&"-1".repeat(KEY_LEN)).is_err());
        assert!(EmbeddingCipher::from_hex(&format!("  {}\n", KEY_HEX.to_uppercase())).is_ok());
    }
}
