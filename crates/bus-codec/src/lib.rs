//! Symmetric-key authenticated framing and corruption-detection checksums.
//!
//! `Key` is the Rust analogue of `cryptography.fernet.Fernet`: a 256-bit
//! master key split into a 128-bit signing half and a 128-bit encryption
//! half, AES-128-CBC with a random IV, HMAC-SHA256 authentication, and a
//! versioned URL-safe-base64 text envelope. Decryption fails uniformly with
//! `CodecError::InvalidToken` on tag mismatch, version mismatch, or
//! truncation — the `fernet` crate already collapses those cases the way
//! the spec requires.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use md5::{Digest, Md5};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid token")]
    InvalidToken,
    #[error("key generation or parsing failed: {0}")]
    InvalidKey(String),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A 128-bit (well, 256-bit master / 44-char base64) symmetric key used for
/// both account keys and the rotating bootstrap key.
#[derive(Clone)]
pub struct Key {
    fernet: fernet::Fernet,
    text: String,
}

impl Key {
    /// Generate a fresh key, equivalent to `Fernet.generate_key()`.
    pub fn generate() -> Self {
        let text = fernet::Fernet::generate_key();
        Self::from_text(&text).expect("freshly generated key must parse")
    }

    /// Parse a key from its URL-safe-base64 text form (44 bytes).
    pub fn from_text(text: &str) -> Result<Self, CodecError> {
        let fernet = fernet::Fernet::new(text).ok_or_else(|| {
            CodecError::InvalidKey(format!("not a valid fernet key: {text}"))
        })?;
        Ok(Key {
            fernet,
            text: text.to_owned(),
        })
    }

    /// The URL-safe-base64 text form, as persisted in `account.json`.
    pub fn as_text(&self) -> &str {
        &self.text
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        self.fernet.encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CodecError> {
        self.fernet
            .decrypt(ciphertext)
            .map_err(|_| CodecError::InvalidToken)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("text", &"<redacted>").finish()
    }
}

/// MD5 over the canonical JSON serialization of `payload`: compact form,
/// default `serde_json` serializer, keys in the map's own insertion order.
/// Corruption detection only — never used for anything security-sensitive.
pub fn md5_hex(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).expect("Value always serializes");
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

pub fn verify_md5(payload: &serde_json::Value, checksum: &str) -> bool {
    md5_hex(payload) == checksum
}

/// SHA-256 of a byte slice, for the file-transfer hash check.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Sha256;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Base64 encode/decode for the bootstrap identity blob (§6). Distinct from
/// the Fernet envelope's own internal base64 handling.
pub fn b64enc(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64dec(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(URL_SAFE_NO_PAD.decode(text)?)
}
