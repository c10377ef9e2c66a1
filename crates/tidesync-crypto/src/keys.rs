//! On-disk key records and the key store.
//!
//! The hierarchy has three layers: a master key wrapped by a
//! password-derived key, per-share keys wrapped by the master, and
//! per-file keys wrapped by the share key (those live inside file headers,
//! not here). A recovery record wraps the same master bytes under a key
//! derived from a one-time recovery secret.
//!
//! Every record is a JSON [`EncryptedKey`] in the `keys/` directory with
//! file mode 0600. Key wrapping uses AES-256-GCM throughout.

use crate::cipher::{self, CipherAlgorithm, SecretKey};
use crate::kdf;
use crate::{CryptoError, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Algorithm used for every key-wrapping record.
const WRAP_ALGORITHM: CipherAlgorithm = CipherAlgorithm::Aes256Gcm;

/// What a key record protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// The install-wide master key, wrapped by a password-derived key.
    Master,
    /// A per-share key, wrapped by the master key.
    Share,
    /// A per-device secret, wrapped by the master key.
    Device,
    /// The master key re-wrapped under the recovery-derived key.
    Recovery,
}

/// A wrapped key at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    /// Stable record identifier.
    pub id: String,
    /// Record kind.
    pub kind: KeyKind,
    /// Wrapping algorithm identifier.
    pub algorithm: String,
    /// Wrapped key bytes including the AEAD tag.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Wrapping nonce.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    /// KDF salt; present only on password-derived records.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub salt: Option<Vec<u8>>,
    /// Record creation instant.
    pub created_at: DateTime<Utc>,
    /// Optional expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form metadata (e.g. `share_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Wrap `payload` under `wrapping` into a fresh record.
pub fn wrap_key(
    wrapping: &SecretKey,
    payload: &SecretKey,
    kind: KeyKind,
    salt: Option<Vec<u8>>,
    metadata: Option<BTreeMap<String, String>>,
) -> Result<EncryptedKey> {
    let framed = cipher::seal(WRAP_ALGORITHM, wrapping, payload.as_bytes())?;
    let nonce_len = WRAP_ALGORITHM.nonce_len();

    Ok(EncryptedKey {
        id: random_id(),
        kind,
        algorithm: WRAP_ALGORITHM.as_str().to_string(),
        ciphertext: framed[nonce_len..].to_vec(),
        nonce: framed[..nonce_len].to_vec(),
        salt,
        created_at: Utc::now(),
        expires_at: None,
        metadata,
    })
}

/// Unwrap a record with `wrapping`.
pub fn unwrap_key(wrapping: &SecretKey, record: &EncryptedKey) -> Result<SecretKey> {
    let algorithm = CipherAlgorithm::parse(&record.algorithm)?;
    let mut framed = Vec::with_capacity(record.nonce.len() + record.ciphertext.len());
    framed.extend_from_slice(&record.nonce);
    framed.extend_from_slice(&record.ciphertext);
    let plain = cipher::open(algorithm, wrapping, &framed)?;
    SecretKey::from_slice(&plain)
}

fn random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Directory-backed store of wrapped key records.
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Open (creating if needed) the key directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir: dir.as_ref().to_path_buf() })
    }

    /// Whether a master record exists.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.dir.join("master.key").exists()
    }

    /// Create the master key, wrapped under `password`.
    ///
    /// Refuses to overwrite an existing master record.
    pub fn init_master(&self, password: &[u8]) -> Result<SecretKey> {
        let path = self.dir.join("master.key");
        if path.exists() {
            return Err(CryptoError::Malformed(
                "master key already initialized".to_string(),
            ));
        }

        let master = SecretKey::generate();
        let salt = kdf::generate_salt();
        let wrapping = kdf::derive_key(password, &salt)?;
        let record = wrap_key(&wrapping, &master, KeyKind::Master, Some(salt.to_vec()), None)?;
        self.write_record(&path, &record)?;

        info!("master key initialized");
        Ok(master)
    }

    /// Unwrap the master key with `password`.
    ///
    /// An authentication failure here means the password is wrong and is
    /// reported as such, distinct from tampered-data failures elsewhere.
    pub fn unlock_master(&self, password: &[u8]) -> Result<SecretKey> {
        let record = self.read_record(&self.dir.join("master.key"))?;
        let salt = record
            .salt
            .as_deref()
            .ok_or_else(|| CryptoError::Malformed("master record has no salt".to_string()))?;
        let wrapping = kdf::derive_key(password, salt)?;
        match unwrap_key(&wrapping, &record) {
            Ok(master) => Ok(master),
            Err(CryptoError::Aead) => Err(CryptoError::WrongPassword),
            Err(e) => Err(e),
        }
    }

    /// Re-wrap the master key under a new password with a fresh salt.
    ///
    /// The master bytes are unchanged, so share and file keys keep
    /// unwrapping without re-encryption.
    pub fn change_password(&self, old_password: &[u8], new_password: &[u8]) -> Result<()> {
        let master = self.unlock_master(old_password)?;
        let salt = kdf::generate_salt();
        let wrapping = kdf::derive_key(new_password, &salt)?;
        let record = wrap_key(&wrapping, &master, KeyKind::Master, Some(salt.to_vec()), None)?;
        self.write_record(&self.dir.join("master.key"), &record)?;
        info!("master key password rotated");
        Ok(())
    }

    /// Generate a recovery secret and persist the master wrapped under it.
    ///
    /// The returned hex string is the only copy of the secret; it is shown
    /// to the user once and never written to disk.
    pub fn generate_recovery(&self, master: &SecretKey) -> Result<String> {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);

        let wrapping = kdf::derive_recovery_key(&secret)?;
        let record = wrap_key(&wrapping, master, KeyKind::Recovery, None, None)?;
        self.write_record(&self.dir.join("recovery.key"), &record)?;

        info!("recovery key generated");
        Ok(hex::encode(secret))
    }

    /// Unwrap the master key from the recovery record.
    pub fn unlock_with_recovery(&self, recovery_hex: &str) -> Result<SecretKey> {
        let secret = hex::decode(recovery_hex.trim())
            .map_err(|_| CryptoError::Malformed("recovery secret is not hex".to_string()))?;
        let wrapping = kdf::derive_recovery_key(&secret)?;
        let record = self.read_record(&self.dir.join("recovery.key"))?;
        match unwrap_key(&wrapping, &record) {
            Ok(master) => Ok(master),
            Err(CryptoError::Aead) => Err(CryptoError::WrongPassword),
            Err(e) => Err(e),
        }
    }

    /// Load the share key for `share_id`, creating it on first use.
    pub fn share_key(&self, master: &SecretKey, share_id: &str) -> Result<SecretKey> {
        let path = self.dir.join(format!("share_{share_id}.key"));
        if path.exists() {
            let record = self.read_record(&path)?;
            return unwrap_key(master, &record);
        }

        let key = SecretKey::generate();
        let metadata = BTreeMap::from([("share_id".to_string(), share_id.to_string())]);
        let record = wrap_key(master, &key, KeyKind::Share, None, Some(metadata))?;
        self.write_record(&path, &record)?;
        debug!(share_id, "share key created");
        Ok(key)
    }

    /// Identifier of the share-key record for `share_id`, if one exists.
    pub fn share_key_id(&self, share_id: &str) -> Result<String> {
        let path = self.dir.join(format!("share_{share_id}.key"));
        let record = self.read_record(&path)?;
        Ok(record.id)
    }

    /// Load the device secret for `device_id`, creating it on first use.
    pub fn device_key(&self, master: &SecretKey, device_id: &str) -> Result<SecretKey> {
        let path = self.dir.join(format!("device_{device_id}.key"));
        if path.exists() {
            let record = self.read_record(&path)?;
            return unwrap_key(master, &record);
        }

        let key = SecretKey::generate();
        let metadata = BTreeMap::from([("device_id".to_string(), device_id.to_string())]);
        let record = wrap_key(master, &key, KeyKind::Device, None, Some(metadata))?;
        self.write_record(&path, &record)?;
        debug!(device_id, "device key created");
        Ok(key)
    }

    fn read_record(&self, path: &Path) -> Result<EncryptedKey> {
        if !path.exists() {
            return Err(CryptoError::KeyNotFound(path.display().to_string()));
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_record(&self, path: &Path, record: &EncryptedKey) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("key.tmp");
        fs::write(&tmp, &json)?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
