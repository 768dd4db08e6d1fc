// Copyright NRG-CHAMP contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! On-disk blocks.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use champ_repr::canonical::{self, CanonicalError};

use crate::transaction::Transaction;

/// The `version` field of every block header written by current code.
pub const BLOCK_VERSION: &str = "v2";

/// Writing `block_size` into the header changes the serialized length, so the
/// final size is found by iteration. The size function grows by at most the
/// digit-width of the length per round, so it converges within one
/// digit-growth step; more rounds than this means the serializer is not
/// deterministic, which must be fixed, not masked.
const SIZE_FIXED_POINT_ROUNDS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("block serialization failed: {0}")]
    Canonical(#[from] CanonicalError),
    #[error("block serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("block size failed to reach a fixed point after {SIZE_FIXED_POINT_ROUNDS} rounds")]
    SizeDiverged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub version: String,
    pub height: u64,
    /// The previous block's `header_hash`; empty at height 0.
    pub prev_header_hash: String,
    /// Merkle root over the block's transaction leaves.
    pub data_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Byte length of the serialized block line, newline excluded.
    pub block_size: u64,
    /// 16 random bytes, hex encoded; distinct per block.
    pub nonce: String,
    /// SHA-256 over the canonical header without this field.
    #[serde(default)]
    pub header_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockV2 {
    pub header: BlockHeader,
    pub data: BlockData,
}

/// The block coordinates handed to the public publisher after an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub height: u64,
    pub header_hash: String,
    pub data_hash: String,
}

impl BlockHeader {
    /// SHA-256 over the canonical header, `header_hash` excluded.
    pub fn compute_hash(&self) -> Result<String, CanonicalError> {
        let bytes = canonical::to_bytes_without(self, &["headerHash"])?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }
}

impl BlockV2 {
    /// Builds and seals a block, returning it along with its serialized line
    /// (newline not included).
    ///
    /// `block_size` participates in `header_hash`, so sealing iterates: hash
    /// the header, serialize, measure, and repeat until the measured length
    /// equals the recorded one.
    pub fn seal(
        height: u64,
        prev_header_hash: String,
        transactions: Vec<Transaction>,
        timestamp: DateTime<Utc>,
    ) -> Result<(BlockV2, Vec<u8>), BlockError> {
        let leaves = transactions
            .iter()
            .map(|tx| tx.leaf_hash())
            .collect::<Result<Vec<_>, _>>()?;
        let mut block = BlockV2 {
            header: BlockHeader {
                version: BLOCK_VERSION.to_string(),
                height,
                prev_header_hash,
                data_hash: merkle_root(&leaves),
                timestamp,
                block_size: 0,
                nonce: new_nonce(),
                header_hash: String::new(),
            },
            data: BlockData { transactions },
        };
        for _ in 0..SIZE_FIXED_POINT_ROUNDS {
            block.header.header_hash = block.header.compute_hash()?;
            let line = serde_json::to_vec(&block)?;
            let len = line.len() as u64;
            if len == block.header.block_size {
                return Ok((block, line));
            }
            block.header.block_size = len;
        }
        Err(BlockError::SizeDiverged)
    }
}

fn new_nonce() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    hex::encode(nonce)
}

/// Computes the Merkle root over the given leaves, hex encoded.
///
/// An odd node at any level is paired with itself. A single leaf is its own
/// root.
pub fn merkle_root(leaves: &[[u8; 32]]) -> String {
    if leaves.is_empty() {
        return hex::encode(Sha256::digest([]));
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(pair[0]);
            hasher.update(pair.get(1).unwrap_or(&pair[0]));
            next.push(hasher.finalize().into());
        }
        level = next;
    }
    hex::encode(level[0])
}
