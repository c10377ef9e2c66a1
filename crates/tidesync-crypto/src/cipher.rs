//! AEAD cipher dispatch and key material.
//!
//! Every ciphertext this module produces is framed `nonce || ciphertext`,
//! with the nonce length fixed by the algorithm. The tag rides inside the
//! ciphertext as the aead crates emit it.

use crate::{CryptoError, KEY_SIZE, Result};
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size shared by all three ciphers (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    /// AES-256-GCM, 12-byte nonce.
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// ChaCha20-Poly1305, 12-byte nonce.
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305, 24-byte nonce; the extended nonce is required
    /// for the chunk-counter construction of streamed containers.
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// Nonce length in bytes.
    #[must_use]
    pub fn nonce_len(self) -> usize {
        match self {
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    /// Wire identifier, matching the serde representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::XChaCha20Poly1305 => "xchacha20-poly1305",
        }
    }

    /// Parse a wire identifier; unknown names are a protocol-class error.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-poly1305" => Ok(Self::ChaCha20Poly1305),
            "xchacha20-poly1305" => Ok(Self::XChaCha20Poly1305),
            other => Err(CryptoError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// 256-bit key material, zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, checking the length.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Generate a fresh random key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw key bytes. Handle with care.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Encrypt with a random nonce; returns `nonce || ciphertext`.
pub fn seal(algorithm: CipherAlgorithm, key: &SecretKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; algorithm.nonce_len()];
    OsRng.fill_bytes(&mut nonce);
    seal_with_nonce(algorithm, key, &nonce, plaintext)
}

/// Encrypt with a caller-provided nonce; returns `nonce || ciphertext`.
///
/// Only the streamed container uses this directly, where nonces are chunk
/// counters rather than random draws.
pub fn seal_with_nonce(
    algorithm: CipherAlgorithm,
    key: &SecretKey,
    nonce: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != algorithm.nonce_len() {
        return Err(CryptoError::Malformed(format!(
            "nonce length {} for {}",
            nonce.len(),
            algorithm.as_str()
        )));
    }

    let ciphertext = match algorithm {
        CipherAlgorithm::Aes256Gcm => Aes256Gcm::new(key.as_bytes().into())
            .encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::Aead)?,
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.as_bytes().into())
            .encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::Aead)?,
        CipherAlgorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new(key.as_bytes().into())
            .encrypt(chacha20poly1305::XNonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::Aead)?,
    };

    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext` frame.
pub fn open(algorithm: CipherAlgorithm, key: &SecretKey, framed: &[u8]) -> Result<Vec<u8>> {
    let nonce_len = algorithm.nonce_len();
    if framed.len() < nonce_len + TAG_SIZE {
        return Err(CryptoError::Malformed(format!(
            "ciphertext frame of {} bytes is shorter than nonce + tag",
            framed.len()
        )));
    }
    let (nonce, ciphertext) = framed.split_at(nonce_len);

    match algorithm {
        CipherAlgorithm::Aes256Gcm => Aes256Gcm::new(key.as_bytes().into())
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Aead),
        CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.as_bytes().into())
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Aead),
        CipherAlgorithm::XChaCha20Poly1305 => XChaCha20Poly1305::new(key.as_bytes().into())
            .decrypt(chacha20poly1305::XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Aead),
    }
}
