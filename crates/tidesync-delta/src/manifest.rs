//! Block manifests: the per-file hash inventory exchanged for delta
//! transfers.

use crate::rolling::weak_digest;
use crate::{DeltaError, Result, check_block_size, strong_digest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hashes of a single fixed-size block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHash {
    /// Zero-based block index.
    pub index: u64,
    /// Byte offset of the block in the file.
    pub offset: u64,
    /// Block length in bytes; only the last block may be short.
    pub size: u32,
    /// Rolling weak checksum of the block.
    pub weak_hash: u32,
    /// SHA-256 of the block.
    #[serde(with = "hex::serde")]
    pub strong_hash: [u8; 32],
}

/// Ordered block inventory of one file at a given block size.
///
/// Offsets are strictly monotone and block sizes sum to `file_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockManifest {
    /// Total file length in bytes.
    pub file_size: u64,
    /// Block size the manifest was computed at.
    pub block_size: u32,
    /// SHA-256 of the whole file.
    #[serde(with = "hex::serde")]
    pub file_hash: [u8; 32],
    /// Per-block hashes in file order. Empty for a zero-length file.
    pub blocks: Vec<BlockHash>,
}

impl BlockManifest {
    /// Build a manifest over an in-memory byte slice.
    pub fn from_bytes(data: &[u8], block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;

        let mut blocks = Vec::with_capacity(data.len().div_ceil(block_size.max(1)));
        for (index, chunk) in data.chunks(block_size).enumerate() {
            blocks.push(BlockHash {
                index: index as u64,
                offset: index as u64 * block_size as u64,
                size: chunk.len() as u32,
                weak_hash: weak_digest(chunk),
                strong_hash: strong_digest(chunk),
            });
        }

        Ok(Self {
            file_size: data.len() as u64,
            block_size: block_size as u32,
            file_hash: strong_digest(data),
            blocks,
        })
    }

    /// Build a manifest by streaming a file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        check_block_size(block_size)?;

        let mut file = File::open(path)?;
        let mut file_hasher = Sha256::new();
        let mut blocks = Vec::new();
        let mut buffer = vec![0u8; block_size];
        let mut offset = 0u64;
        let mut index = 0u64;

        loop {
            let n = read_full(&mut file, &mut buffer)?;
            if n == 0 {
                break;
            }
            let chunk = &buffer[..n];
            file_hasher.update(chunk);
            blocks.push(BlockHash {
                index,
                offset,
                size: n as u32,
                weak_hash: weak_digest(chunk),
                strong_hash: strong_digest(chunk),
            });
            offset += n as u64;
            index += 1;
            if n < block_size {
                break;
            }
        }

        Ok(Self {
            file_size: offset,
            block_size: block_size as u32,
            file_hash: file_hasher.finalize().into(),
            blocks,
        })
    }

    /// Number of blocks in the manifest.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Index the blocks by weak hash for the delta scan. Colliding weak
    /// hashes keep every candidate; the strong hash disambiguates.
    #[must_use]
    pub fn weak_index(&self) -> HashMap<u32, Vec<&BlockHash>> {
        let mut map: HashMap<u32, Vec<&BlockHash>> = HashMap::new();
        for block in &self.blocks {
            map.entry(block.weak_hash).or_default().push(block);
        }
        map
    }

    /// Index the blocks by strong hash for download reuse matching.
    #[must_use]
    pub fn strong_index(&self) -> HashMap<[u8; 32], &BlockHash> {
        self.blocks.iter().map(|b| (b.strong_hash, b)).collect()
    }

    /// Verify reconstructed bytes against the manifest's file hash.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = strong_digest(data);
        if actual == self.file_hash {
            Ok(())
        } else {
            Err(DeltaError::HashMismatch {
                expected: hex::encode(self.file_hash),
                actual: hex::encode(actual),
            })
        }
    }
}

/// Read until the buffer is full or the reader is exhausted.
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
