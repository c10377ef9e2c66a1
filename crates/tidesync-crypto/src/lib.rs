//! # TideSync Crypto
//!
//! Encryption codec for the TideSync engine.
//!
//! This crate provides:
//! - AEAD encryption (AES-256-GCM, ChaCha20-Poly1305, XChaCha20-Poly1305)
//! - Argon2id password key derivation
//! - The three-layer key hierarchy: password-wrapped master key, per-share
//!   keys wrapped by the master, per-file keys wrapped by the share key
//! - Encrypted file containers in single-shot and chunk-streamed form
//! - Recovery-key wrapping of the master key and password rotation
//!
//! All long-lived key material lives in [`SecretKey`], which zeroizes on
//! drop. Distinct failure classes stay distinct: a wrong password, a
//! tampered ciphertext, and a plaintext-hash mismatch each surface as their
//! own [`CryptoError`] variant.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cipher;
pub mod container;
pub mod kdf;
pub mod keys;

pub use cipher::{CipherAlgorithm, SecretKey};
pub use container::{FileEncryptionHeader, decrypt_bytes, decrypt_stream, encrypt_bytes, encrypt_stream};
pub use keys::{EncryptedKey, KeyKind, KeyStore};

use thiserror::Error;

/// Key size for every layer of the hierarchy (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Errors produced by the encryption codec.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Master key decryption failed; the password is wrong.
    #[error("wrong password: master key authentication failed")]
    WrongPassword,

    /// AEAD authentication failed; the ciphertext was tampered with.
    #[error("ciphertext authentication failed")]
    Aead,

    /// Decrypted plaintext does not hash to the header's declared hash.
    #[error("plaintext hash {actual} does not match header hash {expected}")]
    Integrity {
        /// Hash declared by the header (hex).
        expected: String,
        /// Hash of the decrypted bytes (hex).
        actual: String,
    },

    /// The algorithm identifier is not one this codec speaks.
    #[error("unknown cipher algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Raw key material has the wrong length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Required length.
        expected: usize,
        /// Provided length.
        actual: usize,
    },

    /// Container framing is broken (short header, bad length prefix, ...).
    #[error("malformed container: {0}")]
    Malformed(String),

    /// A key record is missing from the key store.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key record serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
