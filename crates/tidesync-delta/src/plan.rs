//! Delta and download plans.
//!
//! A [`DeltaPlan`] expresses a local file as a sequence of references to
//! blocks a remote manifest already describes, plus literal runs for
//! everything in between. A [`DownloadPlan`] walks a remote manifest the
//! other way around and decides, block by block, whether the bytes can be
//! reused from the local file or must be fetched.

use crate::manifest::{BlockHash, BlockManifest};
use crate::rolling::RollingHash;
use crate::{DeltaError, Result, strong_digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// One instruction of a delta plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// The window at `offset` in the scanned file equals remote block
    /// `index`; the receiver can source those bytes from its own copy.
    Copy {
        /// Remote block index the window matched.
        index: u64,
        /// Offset of the matched window in the scanned file.
        offset: u64,
        /// Window length in bytes.
        size: u32,
    },
    /// Bytes with no counterpart in the remote manifest.
    Literal(Vec<u8>),
}

/// Instruction list transforming a remote file's blocks into the scanned
/// local content, with match statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaPlan {
    /// Instructions in output order.
    pub ops: Vec<DeltaOp>,
    /// Bytes covered by copy instructions.
    pub bytes_matched: u64,
    /// Bytes carried as literals.
    pub bytes_literal: u64,
}

impl DeltaPlan {
    /// Scan `local` against `remote` with a byte-granular rolling window.
    ///
    /// At every offset the weak hash is probed against the remote block
    /// table; a weak hit is confirmed with a strong hash over the window
    /// before a copy is emitted and the window jumps a full block. A miss
    /// moves a single byte from the window into the pending literal run.
    #[must_use]
    pub fn compute(local: &[u8], remote: &BlockManifest) -> Self {
        let block_size = remote.block_size as usize;
        let index = remote.weak_index();

        let mut ops = Vec::new();
        let mut literal: Vec<u8> = Vec::new();
        let mut bytes_matched = 0u64;
        let mut bytes_literal = 0u64;

        let mut pos = 0usize;
        let mut rolling = RollingHash::new();
        let mut rolling_valid = false;

        while pos + block_size <= local.len() {
            if !rolling_valid {
                rolling.init(&local[pos..pos + block_size]);
                rolling_valid = true;
            }

            let window = &local[pos..pos + block_size];
            if let Some(matched) = find_match(&index, rolling.digest(), window) {
                flush_literal(&mut ops, &mut literal, &mut bytes_literal);
                ops.push(DeltaOp::Copy {
                    index: matched.index,
                    offset: pos as u64,
                    size: block_size as u32,
                });
                bytes_matched += block_size as u64;
                pos += block_size;
                rolling_valid = false;
            } else {
                literal.push(local[pos]);
                if pos + block_size < local.len() {
                    rolling.roll(local[pos], local[pos + block_size]);
                } else {
                    rolling_valid = false;
                }
                pos += 1;
            }
        }

        // The tail is shorter than a block; it can still equal the remote
        // manifest's short last block.
        let tail = &local[pos..];
        if !tail.is_empty() {
            if let Some(matched) = find_tail_match(&index, tail) {
                flush_literal(&mut ops, &mut literal, &mut bytes_literal);
                ops.push(DeltaOp::Copy {
                    index: matched.index,
                    offset: pos as u64,
                    size: tail.len() as u32,
                });
                bytes_matched += tail.len() as u64;
            } else {
                literal.extend_from_slice(tail);
            }
        }
        flush_literal(&mut ops, &mut literal, &mut bytes_literal);

        debug!(
            matched = bytes_matched,
            literal = bytes_literal,
            ops = ops.len(),
            "delta plan computed"
        );

        Self { ops, bytes_matched, bytes_literal }
    }

    /// Fraction of scanned bytes covered by copy instructions.
    #[must_use]
    pub fn savings(&self) -> f64 {
        let total = self.bytes_matched + self.bytes_literal;
        if total == 0 {
            0.0
        } else {
            self.bytes_matched as f64 / total as f64
        }
    }

    /// Re-materialize the scanned content from the plan and the file it
    /// was computed over. Used to verify plans before trusting them.
    pub fn apply(&self, source: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((self.bytes_matched + self.bytes_literal) as usize);
        for op in &self.ops {
            match op {
                DeltaOp::Copy { offset, size, .. } => {
                    let start = *offset as usize;
                    let end = start + *size as usize;
                    if end > source.len() {
                        return Err(DeltaError::CopyOutOfRange {
                            offset: *offset,
                            size: *size,
                            len: source.len() as u64,
                        });
                    }
                    out.extend_from_slice(&source[start..end]);
                }
                DeltaOp::Literal(data) => out.extend_from_slice(data),
            }
        }
        Ok(out)
    }
}

fn flush_literal(ops: &mut Vec<DeltaOp>, literal: &mut Vec<u8>, bytes_literal: &mut u64) {
    if !literal.is_empty() {
        *bytes_literal += literal.len() as u64;
        ops.push(DeltaOp::Literal(std::mem::take(literal)));
    }
}

fn find_match<'a>(
    index: &HashMap<u32, Vec<&'a BlockHash>>,
    weak: u32,
    window: &[u8],
) -> Option<&'a BlockHash> {
    let candidates = index.get(&weak)?;
    let strong = strong_digest(window);
    candidates
        .iter()
        .find(|c| c.size as usize == window.len() && c.strong_hash == strong)
        .copied()
}

fn find_tail_match<'a>(
    index: &HashMap<u32, Vec<&'a BlockHash>>,
    tail: &[u8],
) -> Option<&'a BlockHash> {
    let weak = crate::rolling::weak_digest(tail);
    find_match(index, weak, tail)
}

/// Where the bytes of one remote block come from during a delta download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSource {
    /// The block's bytes exist in the local file at this offset.
    Reuse {
        /// Offset of the identical block in the local file.
        local_offset: u64,
    },
    /// The block must be fetched from the remote store.
    Fetch,
}

/// One remote block with its resolved byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadBlock {
    /// Remote block index.
    pub index: u64,
    /// Remote block offset.
    pub offset: u64,
    /// Block length.
    pub size: u32,
    /// Source decision.
    pub source: BlockSource,
}

/// Per-block fetch/reuse partition of a remote manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPlan {
    /// Remote blocks in manifest order.
    pub blocks: Vec<DownloadBlock>,
    /// Bytes sourced from the local file.
    pub reused_bytes: u64,
    /// Bytes that must travel over the wire.
    pub fetch_bytes: u64,
}

impl DownloadPlan {
    /// Match every remote block's strong hash against the local manifest.
    #[must_use]
    pub fn compute(remote: &BlockManifest, local: &BlockManifest) -> Self {
        let local_index = local.strong_index();

        let mut blocks = Vec::with_capacity(remote.blocks.len());
        let mut reused_bytes = 0u64;
        let mut fetch_bytes = 0u64;

        for block in &remote.blocks {
            let source = match local_index.get(&block.strong_hash) {
                Some(hit) if hit.size == block.size => {
                    reused_bytes += u64::from(block.size);
                    BlockSource::Reuse { local_offset: hit.offset }
                }
                _ => {
                    fetch_bytes += u64::from(block.size);
                    BlockSource::Fetch
                }
            };
            blocks.push(DownloadBlock {
                index: block.index,
                offset: block.offset,
                size: block.size,
                source,
            });
        }

        Self { blocks, reused_bytes, fetch_bytes }
    }

    /// Fraction of remote blocks that have to be fetched.
    #[must_use]
    pub fn missing_fraction(&self) -> f64 {
        if self.blocks.is_empty() {
            0.0
        } else {
            let missing = self
                .blocks
                .iter()
                .filter(|b| matches!(b.source, BlockSource::Fetch))
                .count();
            missing as f64 / self.blocks.len() as f64
        }
    }

    /// Number of blocks that must be fetched.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b.source, BlockSource::Fetch))
            .count()
    }
}
