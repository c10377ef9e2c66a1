//! Encrypted file containers.
//!
//! Layout, single-shot:
//!
//! ```text
//! u32 BE header length | JSON header | nonce || ciphertext
//! ```
//!
//! Layout, streamed:
//!
//! ```text
//! u32 BE header length | JSON header
//!   repeated: u32 BE ciphertext length | 24-byte nonce | ciphertext
//!   terminator: u32 BE zero
//! ```
//!
//! Streamed chunks are XChaCha20-Poly1305 only; the chunk nonce carries the
//! big-endian chunk index in its leading 8 bytes, binding ciphertext order.
//! Integrity is double-checked: every AEAD tag, plus a SHA-256 of the whole
//! plaintext carried in the header and verified after decryption.

use crate::cipher::{self, CipherAlgorithm, SecretKey, TAG_SIZE};
use crate::{CryptoError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use subtle::ConstantTimeEq;
use tracing::debug;

/// Current container format version.
pub const CONTAINER_VERSION: u32 = 1;

/// Default chunk size for streamed containers (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Upper bound accepted for a single chunk frame; larger length prefixes
/// are treated as corruption rather than honored as allocations.
const MAX_CHUNK_FRAME: u32 = 64 * 1024 * 1024;

/// Nonce length of the streamed chunk frames.
const STREAM_NONCE_LEN: usize = 24;

/// JSON header prefixed to every encrypted file payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEncryptionHeader {
    /// Container format version.
    pub version: u32,
    /// Payload cipher identifier.
    pub algorithm: String,
    /// Identifier of the share-key record that wraps the file key.
    pub key_id: String,
    /// File key wrapped by the share key (ciphertext incl. tag).
    #[serde(with = "b64")]
    pub wrapped_file_key: Vec<u8>,
    /// Nonce of the file-key wrap.
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
    /// Chunk size of a streamed body; 0 for single-shot containers.
    pub chunk_size: u32,
    /// Plaintext length in bytes.
    pub original_size: u64,
    /// SHA-256 of the plaintext.
    #[serde(with = "hex::serde")]
    pub original_strong_hash: [u8; 32],
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FileEncryptionHeader {
    /// Parse the payload algorithm; unknown names are a protocol error.
    pub fn algorithm(&self) -> Result<CipherAlgorithm> {
        CipherAlgorithm::parse(&self.algorithm)
    }
}

fn new_header(
    share_key: &SecretKey,
    key_id: &str,
    algorithm: CipherAlgorithm,
    file_key: &SecretKey,
    chunk_size: u32,
    original_size: u64,
    original_strong_hash: [u8; 32],
) -> Result<FileEncryptionHeader> {
    let framed = cipher::seal(algorithm, share_key, file_key.as_bytes())?;
    let nonce_len = algorithm.nonce_len();

    Ok(FileEncryptionHeader {
        version: CONTAINER_VERSION,
        algorithm: algorithm.as_str().to_string(),
        key_id: key_id.to_string(),
        wrapped_file_key: framed[nonce_len..].to_vec(),
        wrap_nonce: framed[..nonce_len].to_vec(),
        chunk_size,
        original_size,
        original_strong_hash,
        created_at: Utc::now(),
        metadata: BTreeMap::new(),
    })
}

fn unwrap_file_key(header: &FileEncryptionHeader, share_key: &SecretKey) -> Result<SecretKey> {
    let algorithm = header.algorithm()?;
    let mut framed = Vec::with_capacity(header.wrap_nonce.len() + header.wrapped_file_key.len());
    framed.extend_from_slice(&header.wrap_nonce);
    framed.extend_from_slice(&header.wrapped_file_key);
    let raw = cipher::open(algorithm, share_key, &framed)?;
    SecretKey::from_slice(&raw)
}

fn encode_header(header: &FileEncryptionHeader, out: &mut Vec<u8>) -> Result<()> {
    let json = serde_json::to_vec(header)?;
    out.extend_from_slice(&(json.len() as u32).to_be_bytes());
    out.extend_from_slice(&json);
    Ok(())
}

fn split_header(container: &[u8]) -> Result<(FileEncryptionHeader, &[u8])> {
    if container.len() < 4 {
        return Err(CryptoError::Malformed("container shorter than length prefix".to_string()));
    }
    let header_len = u32::from_be_bytes([container[0], container[1], container[2], container[3]]) as usize;
    let body_start = 4 + header_len;
    if container.len() < body_start {
        return Err(CryptoError::Malformed("container shorter than declared header".to_string()));
    }
    let header: FileEncryptionHeader = serde_json::from_slice(&container[4..body_start])
        .map_err(|e| CryptoError::Malformed(format!("header decode: {e}")))?;
    if header.version != CONTAINER_VERSION {
        return Err(CryptoError::Malformed(format!(
            "unsupported container version {}",
            header.version
        )));
    }
    Ok((header, &container[body_start..]))
}

fn verify_plaintext_hash(header: &FileEncryptionHeader, plaintext: &[u8]) -> Result<()> {
    let actual: [u8; 32] = Sha256::digest(plaintext).into();
    if bool::from(actual.ct_eq(&header.original_strong_hash)) {
        Ok(())
    } else {
        Err(CryptoError::Integrity {
            expected: hex::encode(header.original_strong_hash),
            actual: hex::encode(actual),
        })
    }
}

/// Encrypt a buffered payload into a single-shot container.
///
/// A fresh random file key is generated, wrapped by `share_key`, and
/// embedded in the header. `key_id` names the share-key record so the
/// decryptor can find the right key.
pub fn encrypt_bytes(
    plaintext: &[u8],
    share_key: &SecretKey,
    key_id: &str,
    algorithm: CipherAlgorithm,
) -> Result<Vec<u8>> {
    let file_key = SecretKey::generate();
    let header = new_header(
        share_key,
        key_id,
        algorithm,
        &file_key,
        0,
        plaintext.len() as u64,
        Sha256::digest(plaintext).into(),
    )?;

    let mut out = Vec::with_capacity(plaintext.len() + 512);
    encode_header(&header, &mut out)?;
    out.extend_from_slice(&cipher::seal(algorithm, &file_key, plaintext)?);

    debug!(
        size = plaintext.len(),
        algorithm = header.algorithm,
        "payload encrypted"
    );
    Ok(out)
}

/// Decrypt a single-shot container.
pub fn decrypt_bytes(container: &[u8], share_key: &SecretKey) -> Result<Vec<u8>> {
    let (header, body) = split_header(container)?;
    if header.chunk_size != 0 {
        return Err(CryptoError::Malformed(
            "streamed container passed to single-shot decrypt".to_string(),
        ));
    }
    let algorithm = header.algorithm()?;
    let file_key = unwrap_file_key(&header, share_key)?;
    let plaintext = cipher::open(algorithm, &file_key, body)?;
    verify_plaintext_hash(&header, &plaintext)?;
    Ok(plaintext)
}

/// Nonce for streamed chunk `index`: big-endian index in the leading
/// 8 bytes, remainder zero.
fn chunk_nonce(index: u64) -> [u8; STREAM_NONCE_LEN] {
    let mut nonce = [0u8; STREAM_NONCE_LEN];
    nonce[..8].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// Encrypt a byte stream into a chunked container.
///
/// The header carries the plaintext size and hash, so both must be known
/// up front (the engine computes them while hashing the file for its own
/// records). Returns the number of container bytes written.
pub fn encrypt_stream(
    reader: &mut impl Read,
    writer: &mut impl Write,
    share_key: &SecretKey,
    key_id: &str,
    chunk_size: u32,
    original_size: u64,
    original_strong_hash: [u8; 32],
) -> Result<u64> {
    if chunk_size == 0 {
        return Err(CryptoError::Malformed("stream chunk size must be non-zero".to_string()));
    }

    let algorithm = CipherAlgorithm::XChaCha20Poly1305;
    let file_key = SecretKey::generate();
    let header = new_header(
        share_key,
        key_id,
        algorithm,
        &file_key,
        chunk_size,
        original_size,
        original_strong_hash,
    )?;

    let mut prefix = Vec::new();
    encode_header(&header, &mut prefix)?;
    writer.write_all(&prefix)?;
    let mut written = prefix.len() as u64;

    let mut buffer = vec![0u8; chunk_size as usize];
    let mut index = 0u64;
    loop {
        let n = read_full(reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        let nonce = chunk_nonce(index);
        let framed = cipher::seal_with_nonce(algorithm, &file_key, &nonce, &buffer[..n])?;
        let ciphertext = &framed[STREAM_NONCE_LEN..];

        writer.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        writer.write_all(&nonce)?;
        writer.write_all(ciphertext)?;
        written += 4 + STREAM_NONCE_LEN as u64 + ciphertext.len() as u64;

        index += 1;
        if n < buffer.len() {
            break;
        }
    }

    // Zero-length terminator frame.
    writer.write_all(&0u32.to_be_bytes())?;
    written += 4;

    debug!(chunks = index, written, "stream encrypted");
    Ok(written)
}

/// Decrypt a chunked container stream, writing plaintext to `writer`.
///
/// Chunk nonces are recomputed from the decryptor's own counter and must
/// match the frame, so reordered or replayed chunks fail authentication.
/// Returns the plaintext length.
pub fn decrypt_stream(
    reader: &mut impl Read,
    writer: &mut impl Write,
    share_key: &SecretKey,
) -> Result<u64> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let header_len = u32::from_be_bytes(len_buf) as usize;
    let mut header_buf = vec![0u8; header_len];
    reader.read_exact(&mut header_buf)?;
    let header: FileEncryptionHeader = serde_json::from_slice(&header_buf)
        .map_err(|e| CryptoError::Malformed(format!("header decode: {e}")))?;
    if header.version != CONTAINER_VERSION {
        return Err(CryptoError::Malformed(format!(
            "unsupported container version {}",
            header.version
        )));
    }
    if header.chunk_size == 0 {
        return Err(CryptoError::Malformed(
            "single-shot container passed to stream decrypt".to_string(),
        ));
    }
    let algorithm = header.algorithm()?;
    if algorithm != CipherAlgorithm::XChaCha20Poly1305 {
        return Err(CryptoError::Malformed(format!(
            "streamed container with non-extended-nonce cipher {}",
            header.algorithm
        )));
    }
    let file_key = unwrap_file_key(&header, share_key)?;

    let mut hasher = Sha256::new();
    let mut total = 0u64;
    let mut index = 0u64;
    loop {
        reader.read_exact(&mut len_buf)?;
        let frame_len = u32::from_be_bytes(len_buf);
        if frame_len == 0 {
            break;
        }
        if frame_len < TAG_SIZE as u32 || frame_len > MAX_CHUNK_FRAME {
            return Err(CryptoError::Malformed(format!("chunk frame length {frame_len}")));
        }

        let mut nonce = [0u8; STREAM_NONCE_LEN];
        reader.read_exact(&mut nonce)?;
        if nonce != chunk_nonce(index) {
            return Err(CryptoError::Aead);
        }

        let mut framed = vec![0u8; STREAM_NONCE_LEN + frame_len as usize];
        framed[..STREAM_NONCE_LEN].copy_from_slice(&nonce);
        reader.read_exact(&mut framed[STREAM_NONCE_LEN..])?;

        let plaintext = cipher::open(algorithm, &file_key, &framed)?;
        hasher.update(&plaintext);
        writer.write_all(&plaintext)?;
        total += plaintext.len() as u64;
        index += 1;
    }

    let actual: [u8; 32] = hasher.finalize().into();
    if !bool::from(actual.ct_eq(&header.original_strong_hash)) {
        return Err(CryptoError::Integrity {
            expected: hex::encode(header.original_strong_hash),
            actual: hex::encode(actual),
        });
    }

    debug!(chunks = index, total, "stream decrypted");
    Ok(total)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyKind, unwrap_key, wrap_key};
    use std::io::Cursor;

    const ALL: [CipherAlgorithm; 3] = [
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::XChaCha20Poly1305,
    ];

    #[test]
    fn test_single_shot_roundtrip_all_algorithms() {
        let share_key = SecretKey::generate();
        let plaintext = b"the five boxing wizards jump quickly".repeat(100);

        for algorithm in ALL {
            let container = encrypt_bytes(&plaintext, &share_key, "k1", algorithm).unwrap();
            let back = decrypt_bytes(&container, &share_key).unwrap();
            assert_eq!(back, plaintext);
        }
    }

    #[test]
    fn test_header_carries_plaintext_hash() {
        let share_key = SecretKey::generate();
        let plaintext = b"hash me";
        let container =
            encrypt_bytes(plaintext, &share_key, "k1", CipherAlgorithm::Aes256Gcm).unwrap();

        let (header, _) = split_header(&container).unwrap();
        let expected: [u8; 32] = Sha256::digest(plaintext).into();
        assert_eq!(header.original_strong_hash, expected);
        assert_eq!(header.original_size, plaintext.len() as u64);
        assert_eq!(header.chunk_size, 0);
    }

    #[test]
    fn test_tampered_ciphertext_is_aead_failure() {
        let share_key = SecretKey::generate();
        let mut container =
            encrypt_bytes(b"payload", &share_key, "k1", CipherAlgorithm::XChaCha20Poly1305)
                .unwrap();
        let last = container.len() - 1;
        container[last] ^= 0x01;
        assert!(matches!(
            decrypt_bytes(&container, &share_key),
            Err(CryptoError::Aead)
        ));
    }

    #[test]
    fn test_hash_mismatch_is_integrity_failure() {
        // Forge a container whose body authenticates but whose header hash
        // lies; the two integrity layers must stay distinguishable.
        let share_key = SecretKey::generate();
        let file_key = SecretKey::generate();
        let algorithm = CipherAlgorithm::Aes256Gcm;

        let mut header = new_header(
            &share_key,
            "k1",
            algorithm,
            &file_key,
            0,
            7,
            [0u8; 32],
        )
        .unwrap();
        header.original_size = 7;

        let mut container = Vec::new();
        encode_header(&header, &mut container).unwrap();
        container.extend_from_slice(&cipher::seal(algorithm, &file_key, b"payload").unwrap());

        assert!(matches!(
            decrypt_bytes(&container, &share_key),
            Err(CryptoError::Integrity { .. })
        ));
    }

    #[test]
    fn test_wrong_share_key_is_aead_failure() {
        let container =
            encrypt_bytes(b"x", &SecretKey::generate(), "k1", CipherAlgorithm::Aes256Gcm).unwrap();
        assert!(matches!(
            decrypt_bytes(&container, &SecretKey::generate()),
            Err(CryptoError::Aead)
        ));
    }

    #[test]
    fn test_unknown_algorithm_in_header() {
        let share_key = SecretKey::generate();
        let container =
            encrypt_bytes(b"x", &share_key, "k1", CipherAlgorithm::Aes256Gcm).unwrap();
        let (mut header, body) = split_header(&container).unwrap();
        header.algorithm = "blowfish-ofb".to_string();

        let mut forged = Vec::new();
        encode_header(&header, &mut forged).unwrap();
        forged.extend_from_slice(body);

        assert!(matches!(
            decrypt_bytes(&forged, &share_key),
            Err(CryptoError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_empty_plaintext_container() {
        let share_key = SecretKey::generate();
        let container =
            encrypt_bytes(b"", &share_key, "k1", CipherAlgorithm::XChaCha20Poly1305).unwrap();
        assert_eq!(decrypt_bytes(&container, &share_key).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_stream_roundtrip_multiple_chunks() {
        let share_key = SecretKey::generate();
        let plaintext: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let hash: [u8; 32] = Sha256::digest(&plaintext).into();

        let mut container = Vec::new();
        encrypt_stream(
            &mut Cursor::new(&plaintext),
            &mut container,
            &share_key,
            "k1",
            1024,
            plaintext.len() as u64,
            hash,
        )
        .unwrap();

        let mut out = Vec::new();
        let total = decrypt_stream(&mut Cursor::new(&container), &mut out, &share_key).unwrap();
        assert_eq!(total, plaintext.len() as u64);
        assert_eq!(out, plaintext);
    }

    #[test]
    fn test_stream_empty_payload() {
        let share_key = SecretKey::generate();
        let hash: [u8; 32] = Sha256::digest(b"").into();

        let mut container = Vec::new();
        encrypt_stream(&mut Cursor::new(&[][..]), &mut container, &share_key, "k1", 1024, 0, hash)
            .unwrap();

        let mut out = Vec::new();
        assert_eq!(
            decrypt_stream(&mut Cursor::new(&container), &mut out, &share_key).unwrap(),
            0
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_stream_chunk_reorder_rejected() {
        let share_key = SecretKey::generate();
        let plaintext = vec![0x5A; 4096];
        let hash: [u8; 32] = Sha256::digest(&plaintext).into();

        let mut container = Vec::new();
        encrypt_stream(
            &mut Cursor::new(&plaintext),
            &mut container,
            &share_key,
            "k1",
            1024,
            plaintext.len() as u64,
            hash,
        )
        .unwrap();

        // Locate the first two frames past the header and swap them.
        let header_len =
            u32::from_be_bytes([container[0], container[1], container[2], container[3]]) as usize;
        let frames_at = 4 + header_len;
        let frame_size = 4 + STREAM_NONCE_LEN + 1024 + TAG_SIZE;
        let mut swapped = container.clone();
        swapped[frames_at..frames_at + frame_size]
            .copy_from_slice(&container[frames_at + frame_size..frames_at + 2 * frame_size]);
        swapped[frames_at + frame_size..frames_at + 2 * frame_size]
            .copy_from_slice(&container[frames_at..frames_at + frame_size]);

        let mut out = Vec::new();
        assert!(matches!(
            decrypt_stream(&mut Cursor::new(&swapped), &mut out, &share_key),
            Err(CryptoError::Aead)
        ));
    }

    #[test]
    fn test_stream_truncation_detected() {
        let share_key = SecretKey::generate();
        let plaintext = vec![1u8; 3000];
        let hash: [u8; 32] = Sha256::digest(&plaintext).into();

        let mut container = Vec::new();
        encrypt_stream(
            &mut Cursor::new(&plaintext),
            &mut container,
            &share_key,
            "k1",
            1024,
            plaintext.len() as u64,
            hash,
        )
        .unwrap();

        // Drop the last frame and the terminator.
        container.truncate(container.len() - (4 + STREAM_NONCE_LEN + 952 + TAG_SIZE) - 4);
        let mut out = Vec::new();
        assert!(decrypt_stream(&mut Cursor::new(&container), &mut out, &share_key).is_err());
    }

    #[test]
    fn test_file_key_unwrap_via_keystore_record() {
        // The header's wrapped file key interoperates with the key-record
        // wrap/unwrap helpers.
        let master = SecretKey::generate();
        let share = SecretKey::generate();
        let record = wrap_key(&master, &share, KeyKind::Share, None, None).unwrap();
        let share_back = unwrap_key(&master, &record).unwrap();

        let container =
            encrypt_bytes(b"nested", &share, "k1", CipherAlgorithm::Aes256Gcm).unwrap();
        assert_eq!(decrypt_bytes(&container, &share_back).unwrap(), b"nested");
    }
}
