//! Frame encryption for the plugin channel.
//!
//! Each channel gets a fresh ChaCha20-Poly1305 key at open; the key is never
//! persisted. Frames on the wire are `nonce || ciphertext` with the AEAD tag
//! verified before any parsing happens.

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
const NONCE_SIZE: usize = 12;

/// Key size for ChaCha20-Poly1305 (32 bytes)
const KEY_SIZE: usize = 32;

/// AEAD tag size (16 bytes)
const TAG_SIZE: usize = 16;

/// Frame crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Frame too short to carry nonce and tag")]
    TruncatedFrame,
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Channel key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey {
    key: [u8; KEY_SIZE],
}

impl ChannelKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// Per-channel frame cipher
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
}

impl FrameCipher {
    pub fn new(key: &ChannelKey) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .expect("key length is fixed at construction");
        Self { cipher }
    }

    /// Seal a plaintext frame. Output is `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    /// Open a sealed frame. The tag is verified before bytes are returned.
    pub fn open(&self, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TruncatedFrame);
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        let ciphertext = &sealed[NONCE_SIZE..];

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = ChannelKey::generate();
        let cipher = FrameCipher::new(&key);

        let sealed = cipher.seal(b"{\"kind\":\"event\"}").unwrap();
        assert_ne!(&sealed, b"{\"kind\":\"event\"}");

        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened, b"{\"kind\":\"event\"}");
    }

    #[test]
    fn test_distinct_nonces() {
        let key = ChannelKey::generate();
        let cipher = FrameCipher::new(&key);

        let a = cipher.seal(b"frame").unwrap();
        let b = cipher.seal(b"frame").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let cipher_a = FrameCipher::new(&ChannelKey::generate());
        let cipher_b = FrameCipher::new(&ChannelKey::generate());

        let sealed = cipher_a.seal(b"frame").unwrap();
        assert!(cipher_b.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_frame_rejected() {
        let key = ChannelKey::generate();
        let cipher = FrameCipher::new(&key);

        let mut sealed = cipher.seal(b"frame").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_truncated_frame() {
        let key = ChannelKey::generate();
        let cipher = FrameCipher::new(&key);
        assert!(matches!(
            cipher.open(&[0u8; 10]),
            Err(CryptoError::TruncatedFrame)
        ));
    }
}
