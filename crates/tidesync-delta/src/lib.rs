//! # TideSync Delta
//!
//! Delta-block codec for the TideSync engine.
//!
//! This crate provides:
//! - Adler-32-class rolling weak hashing with O(1) window rolls
//! - SHA-256 strong hashing of blocks and whole files
//! - Block manifests describing a file at a fixed block size
//! - Delta plans that express one file in terms of another's blocks
//! - Download plans that partition a remote manifest into locally
//!   reusable blocks and blocks that must be fetched

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manifest;
pub mod plan;
pub mod rolling;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Smallest accepted block size (4 KiB).
pub const MIN_BLOCK_SIZE: usize = 4 * 1024;

/// Largest accepted block size (16 MiB).
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Fraction of remote blocks that must be fetchable locally for a delta
/// download to be worth the bookkeeping. Above this missing fraction the
/// caller should fall back to a full download.
pub const FULL_DOWNLOAD_THRESHOLD: f64 = 0.8;

/// Errors produced by the delta codec.
#[derive(Debug, Error)]
pub enum DeltaError {
    /// Block size outside the accepted range.
    #[error("block size {0} outside accepted range [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]")]
    InvalidBlockSize(usize),

    /// A copy instruction references bytes outside the source file.
    #[error("copy range {offset}+{size} exceeds source length {len}")]
    CopyOutOfRange {
        /// Start of the copy range.
        offset: u64,
        /// Length of the copy range.
        size: u32,
        /// Length of the source the range was applied to.
        len: u64,
    },

    /// Reconstructed bytes do not hash to the manifest's file hash.
    #[error("reconstructed file hash {actual} does not match manifest hash {expected}")]
    HashMismatch {
        /// Hash declared by the manifest (hex).
        expected: String,
        /// Hash of the reconstructed bytes (hex).
        actual: String,
    },

    /// File I/O error while hashing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for delta codec operations.
pub type Result<T> = std::result::Result<T, DeltaError>;

/// Compute the SHA-256 digest of a byte slice.
#[must_use]
pub fn strong_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 digest of a byte slice as lowercase hex.
#[must_use]
pub fn strong_digest_hex(data: &[u8]) -> String {
    hex::encode(strong_digest(data))
}

/// Validate a block size against the accepted range.
pub fn check_block_size(block_size: usize) -> Result<()> {
    if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        Ok(())
    } else {
        Err(DeltaError::InvalidBlockSize(block_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strong_digest_known_value() {
        // SHA-256("hi")
        assert_eq!(
            strong_digest_hex(b"hi"),
            "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
        );
    }

    #[test]
    fn test_strong_digest_empty() {
        assert_eq!(
            strong_digest_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_block_size_bounds() {
        assert!(check_block_size(DEFAULT_BLOCK_SIZE).is_ok());
        assert!(check_block_size(MIN_BLOCK_SIZE).is_ok());
        assert!(check_block_size(MAX_BLOCK_SIZE).is_ok());
        assert!(check_block_size(512).is_err());
        assert!(check_block_size(MAX_BLOCK_SIZE + 1).is_err());
    }
}
