// Copyright 2020 The Arbor Core Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interface to the chain subsystem.
//!
//! The consensus engine never touches storage or validation itself; it reads
//! chain state through [`ChainView`] and submits finalized blocks back through
//! the same trait. The embedding node implements the trait over its block
//! database and miner chain.

use secp256k1::SecretKey;

use std::sync::Arc;

use crate::{
    crypto,
    helpers::{BlockHash, Height, MemberId},
};

/// Snapshot of the best main-chain state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestSnapshot {
    /// Height of the best main-chain block.
    pub height: Height,
    /// Miner-chain height at which the committee was last rotated.
    pub last_rotation: u32,
}

/// A miner-chain block, reduced to the fields the committee logic needs.
#[derive(Debug, Clone)]
pub struct MinerBlock {
    /// Height of this block on the miner chain.
    pub height: u32,
    /// Address of the miner that produced the block.
    pub miner: MemberId,
    /// Reachability descriptor published by the miner: either a plain
    /// `host:port` endpoint or an RSA public key in JSON form.
    pub connection: Vec<u8>,
}

/// Header of a candidate main-chain block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockHeader {
    /// Hash of the previous main-chain block.
    pub prev_block: BlockHash,
    /// Merkle root of the block transactions.
    pub merkle_root: BlockHash,
    /// Block timestamp as unix seconds.
    pub timestamp: u32,
    /// Block nonce.
    pub nonce: i32,
}

/// A main-chain block, reduced to the parts touched by consensus: the header
/// and the coinbase transaction. Transaction validation happens in the chain
/// subsystem before the block ever reaches a syncer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Signature scripts of the coinbase transaction. Position 0 is the
    /// standard coinbase push, position 1 the 20-byte miner identity, and
    /// positions 2.. the consensus signatures collected for the block.
    pub signature_scripts: Vec<Vec<u8>>,
    /// Values of the coinbase award outputs, one per committee member.
    pub award_outputs: Vec<u64>,
}

impl Block {
    /// Hash identifying the block.
    pub fn block_hash(&self) -> BlockHash {
        let mut buf = Vec::with_capacity(72);
        buf.extend_from_slice(self.header.prev_block.as_bytes());
        buf.extend_from_slice(self.header.merkle_root.as_bytes());
        buf.extend_from_slice(&self.header.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.header.nonce.to_le_bytes());
        BlockHash(crypto::double_sha256(&buf))
    }

    /// Miner identity recorded at position 1 of the coinbase signature
    /// scripts, if present.
    pub fn miner(&self) -> Option<MemberId> {
        self.signature_scripts
            .get(1)
            .and_then(|script| MemberId::from_slice(script))
    }

    /// Total fees awarded by the coinbase. All award outputs must carry the
    /// same value; a block violating this yields `None` and is discarded.
    pub fn award_fees(&self) -> Option<u64> {
        let first = *self.award_outputs.first()?;
        if self.award_outputs.iter().any(|&value| value != first) {
            return None;
        }
        Some(first * self.award_outputs.len() as u64)
    }
}

/// Verdict of the chain subsystem on a submitted block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockVerdict {
    /// The block extends the main chain.
    pub on_main_chain: bool,
    /// The block is an orphan.
    pub orphan: bool,
}

/// Notifications published by the chain subsystem and consumed by the
/// consensus supervisor.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was connected to the main chain, possibly advancing the
    /// committee rotation.
    BlockConnected {
        /// New best height.
        height: Height,
        /// Miner-chain height of the last committee rotation.
        last_rotation: u32,
    },
    /// A candidate block passed local validation.
    CandidateBlock {
        /// Height the candidate is competing for.
        height: Height,
        /// The candidate block.
        block: Arc<Block>,
    },
}

/// Read access to the chain subsystem plus block submission.
///
/// Snapshots are immutable: any chain mutation happens inside the chain
/// subsystem, which then publishes a new snapshot.
pub trait ChainView: Send + Sync + 'static {
    /// Returns the current best main-chain state.
    fn best_snapshot(&self) -> BestSnapshot;

    /// Returns the miner-chain block at the given miner height.
    fn miner_block_by_height(&self, height: u32) -> Option<MinerBlock>;

    /// Returns a candidate block by its hash, if the block subsystem has it.
    fn block_by_hash(&self, hash: &BlockHash) -> Option<Arc<Block>>;

    /// Submits a finalized block to the chain.
    fn process_block(&self, block: Block) -> anyhow::Result<BlockVerdict>;

    /// Returns the signing key for a local miner address, if this node
    /// controls it.
    fn signing_key(&self, member: &MemberId) -> Option<SecretKey>;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn block_with_outputs(outputs: &[u64]) -> Block {
        Block {
            award_outputs: outputs.to_vec(),
            ..Block::default()
        }
    }

    #[test]
    fn award_fees_requires_equal_outputs() {
        assert_eq!(block_with_outputs(&[25, 25, 25, 25]).award_fees(), Some(100));
        assert_eq!(block_with_outputs(&[25, 30, 25, 25]).award_fees(), None);
        assert_eq!(block_with_outputs(&[]).award_fees(), None);
    }

    #[test]
    fn block_hash_depends_on_header() {
        let block = Block::default();
        let mut other = Block::default();
        other.header.nonce = 7;
        assert_ne!(block.block_hash(), other.block_hash());
        assert_eq!(block.block_hash(), Block::default().block_hash());
    }

    #[test]
    fn miner_identity_read_from_scripts() {
        let mut block = Block::default();
        assert_eq!(block.miner(), None);
        block.signature_scripts = vec![vec![0; 8], vec![0xcd; 20]];
        assert_eq!(block.miner(), Some(MemberId([0xcd; 20])));
    }
}
