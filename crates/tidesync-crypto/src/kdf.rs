//! Argon2id password key derivation.

use crate::cipher::SecretKey;
use crate::{CryptoError, KEY_SIZE, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;

/// Argon2id memory cost in KiB (64 MiB).
pub const ARGON2_MEMORY_COST: u32 = 65536;

/// Argon2id iteration count.
pub const ARGON2_TIME_COST: u32 = 3;

/// Argon2id lane count.
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for password-derived key records (32 bytes).
pub const SALT_SIZE: usize = 32;

/// Fixed salt bytes for the recovery-key derivation.
pub const RECOVERY_SALT: &[u8] = b"recovery";

/// Generate a fresh random salt for a password-derived record.
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte wrapping key from a password and salt.
pub fn derive_key(password: &[u8], salt: &[u8]) -> Result<SecretKey> {
    let params = Params::new(
        ARGON2_MEMORY_COST,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Kdf(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;

    Ok(SecretKey::new(out))
}

/// Derive the wrapping key for a raw recovery secret.
///
/// The recovery secret runs through the same KDF as a password, with a
/// fixed salt so the derivation is reproducible from the secret alone.
pub fn derive_recovery_key(recovery_secret: &[u8]) -> Result<SecretKey> {
    derive_key(recovery_secret, RECOVERY_SALT)
}
