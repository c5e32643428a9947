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

//! State of a per-height syncer.

use bit_vec::BitVec;
use log::trace;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    chain::{Block, BlockHeader, ChainView},
    helpers::{BlockHash, Height, MemberId},
    knowledge::KnowledgeBase,
    messages::Knowledge,
};

/// A candidate block proposed by a committee member for the current height.
///
/// A tree may be known by hash alone while the block is being pulled.
#[derive(Debug, Clone)]
pub struct CandidateTree {
    /// The member that mined the candidate.
    pub creator: MemberId,
    /// Total coinbase fees of the candidate.
    pub fees: u64,
    /// Hash of the candidate block.
    pub hash: BlockHash,
    /// Header, once known.
    pub header: Option<BlockHeader>,
    /// The block itself, once pulled.
    pub block: Option<Arc<Block>>,
}

impl CandidateTree {
    /// A hash-only placeholder for a tree referenced before its block
    /// arrived.
    pub fn placeholder(creator: MemberId, hash: BlockHash) -> Self {
        Self {
            creator,
            fees: 0,
            hash,
            header: None,
            block: None,
        }
    }
}

/// The committee of one height: the `n` most recent miner-chain block
/// producers ending at the rotation point, indexed 0..n-1.
#[derive(Debug, Clone)]
pub struct Committee {
    base: u32,
    members: Vec<MemberId>,
    lookup: HashMap<MemberId, usize>,
}

impl Committee {
    /// Reads the committee window ending at `last_rotation` from the miner
    /// chain. Returns `None` while any window block is still missing.
    pub fn from_chain(
        chain: &dyn ChainView,
        last_rotation: u32,
        committee_size: u32,
    ) -> Option<Self> {
        let base = (last_rotation + 1).checked_sub(committee_size)?;
        let mut members = Vec::with_capacity(committee_size as usize);
        let mut lookup = HashMap::new();
        for height in base..=last_rotation {
            let block = chain.miner_block_by_height(height)?;
            lookup.insert(block.miner, members.len());
            members.push(block.miner);
        }
        Some(Self {
            base,
            members,
            lookup,
        })
    }

    #[cfg(test)]
    pub fn from_members(base: u32, members: Vec<MemberId>) -> Self {
        let lookup = members
            .iter()
            .enumerate()
            .map(|(index, &member)| (member, index))
            .collect();
        Self {
            base,
            members,
            lookup,
        }
    }

    /// Number of members, `n`.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Miner height of the first window member.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Index of a member within the window.
    pub fn index_of(&self, member: &MemberId) -> Option<usize> {
        self.lookup.get(member).copied()
    }

    /// Member at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of the window.
    pub fn member(&self, index: usize) -> MemberId {
        self.members[index]
    }

    /// Miner height of the member at the given index.
    pub fn miner_height(&self, index: usize) -> u32 {
        self.base + index as u32
    }
}

/// Outcome of installing a candidate tree into the forest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TreeInstall {
    /// The tree is new, or completed a hash-only placeholder.
    Installed,
    /// The identical tree was already present.
    AlreadyKnown,
    /// A conflicting tree from the same creator exists; the creator must be
    /// marked malicious.
    Conflict,
}

/// State owned by one syncer. Touched only from the syncer's event loop;
/// the repeater runs in the same loop, so no locking is needed.
#[derive(Debug)]
pub struct SyncerState {
    height: Height,
    runnable: bool,
    done: bool,

    committee: Committee,
    our_id: MemberId,
    our_index: usize,

    forest: HashMap<MemberId, CandidateTree>,
    knows: HashMap<MemberId, Vec<Knowledge>>,
    knowledge: KnowledgeBase,

    asked: HashSet<usize>,
    agrees: HashSet<usize>,
    agreed: Option<usize>,
    sig_given: Option<usize>,

    signed: BitVec,
    signed_count: usize,

    malice: HashSet<MemberId>,
    pulling: HashSet<usize>,

    // Working copy of the signed candidate; signature scripts accumulate
    // here and the copy is handed to the chain on submission, never mutated
    // afterwards.
    working_block: Option<Block>,
}

impl SyncerState {
    pub fn new(height: Height, committee: Committee, our_id: MemberId, our_index: usize) -> Self {
        let n = committee.len();
        Self {
            height,
            runnable: false,
            done: false,
            committee,
            our_id,
            our_index,
            forest: HashMap::new(),
            knows: HashMap::new(),
            knowledge: KnowledgeBase::new(n, our_index),
            asked: HashSet::new(),
            agrees: HashSet::new(),
            agreed: None,
            sig_given: None,
            signed: BitVec::from_elem(n, false),
            signed_count: 0,
            malice: HashSet::new(),
            pulling: HashSet::new(),
            working_block: None,
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn is_runnable(&self) -> bool {
        self.runnable
    }

    pub fn set_runnable(&mut self, runnable: bool) {
        self.runnable = runnable;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_done(&mut self) {
        self.done = true;
        self.runnable = false;
    }

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn our_id(&self) -> MemberId {
        self.our_id
    }

    pub fn our_index(&self) -> usize {
        self.our_index
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    pub fn knowledge_mut(&mut self) -> &mut KnowledgeBase {
        &mut self.knowledge
    }

    /// The index this node currently consents to, if any. May be our own.
    pub fn agreed(&self) -> Option<usize> {
        self.agreed
    }

    pub fn set_agreed(&mut self, agreed: Option<usize>) {
        self.agreed = agreed;
    }

    /// The tree this node has signed. Write-once per height: a member signs
    /// at most one block.
    pub fn sig_given(&self) -> Option<usize> {
        self.sig_given
    }

    /// Engages the signature latch.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when the latch is already engaged with a
    /// different tree.
    pub fn set_sig_given(&mut self, tree: usize) {
        debug_assert!(
            self.sig_given.map_or(true, |given| given == tree),
            "sig_given latch may not be rewritten"
        );
        self.sig_given = Some(tree);
    }

    pub fn asked(&self) -> &HashSet<usize> {
        &self.asked
    }

    pub fn add_asked(&mut self, index: usize) {
        self.asked.insert(index);
    }

    pub fn remove_asked(&mut self, index: usize) {
        self.asked.remove(&index);
    }

    pub fn agrees(&self) -> &HashSet<usize> {
        &self.agrees
    }

    pub fn add_agree(&mut self, index: usize) {
        self.agrees.insert(index);
    }

    pub fn clear_agrees(&mut self) -> HashSet<usize> {
        std::mem::take(&mut self.agrees)
    }

    pub fn is_malicious(&self, member: &MemberId) -> bool {
        self.malice.contains(member)
    }

    pub fn tree(&self, creator: &MemberId) -> Option<&CandidateTree> {
        self.forest.get(creator)
    }

    pub fn tree_by_index(&self, index: usize) -> Option<&CandidateTree> {
        self.forest.get(&self.committee.member(index))
    }

    pub fn our_tree(&self) -> Option<&CandidateTree> {
        self.forest.get(&self.our_id)
    }

    /// Installs a candidate tree, enforcing the one-tree-per-creator rule.
    pub fn install_tree(&mut self, tree: CandidateTree) -> TreeInstall {
        match self.forest.get(&tree.creator) {
            None => {
                self.forest.insert(tree.creator, tree);
                TreeInstall::Installed
            }
            Some(existing) if existing.block.is_none() => {
                // Completing a placeholder; the pulled block wins.
                self.forest.insert(tree.creator, tree);
                TreeInstall::Installed
            }
            Some(existing) if existing.hash != BlockHash::zero() && existing.hash != tree.hash => {
                TreeInstall::Conflict
            }
            Some(_) => TreeInstall::AlreadyKnown,
        }
    }

    /// Installs a hash-only placeholder for an unknown referenced tree.
    pub fn install_placeholder(&mut self, creator: MemberId, hash: BlockHash) {
        self.forest
            .entry(creator)
            .or_insert_with(|| CandidateTree::placeholder(creator, hash));
    }

    /// Marks a creator malicious: its tree is discarded and its knowledge
    /// row zeroed. All later messages about the creator are dropped.
    pub fn register_malice(&mut self, creator: MemberId) {
        trace!("member {} registered as malicious", creator);
        self.malice.insert(creator);
        self.forest.remove(&creator);
        if let Some(index) = self.committee.index_of(&creator) {
            self.knowledge.malice(index);
        }
    }

    /// Caches a knowledge message under its finder for later relaying.
    /// Messages with an already-cached path are dropped.
    pub fn record_knowledge(&mut self, msg: Knowledge) {
        let cached = self.knows.entry(msg.finder).or_default();
        if cached.iter().any(|known| known.k == msg.k) {
            return;
        }
        cached.push(msg);
    }

    pub fn cached_knowledge(&self, finder: &MemberId) -> &[Knowledge] {
        self.knows.get(finder).map_or(&[], Vec::as_slice)
    }

    /// Candidate ordering: higher fees win, ties break toward the higher
    /// member index. An unknown tree always loses.
    pub fn better(&self, left: usize, right: usize) -> bool {
        let left_tree = match self.tree_by_index(left) {
            Some(tree) => tree,
            None => return false,
        };
        let right_tree = match self.tree_by_index(right) {
            Some(tree) => tree,
            None => return true,
        };
        left_tree.fees > right_tree.fees || (left_tree.fees == right_tree.fees && left > right)
    }

    /// Whether a pull for this member's tree is already in flight.
    pub fn is_pulling(&self, index: usize) -> bool {
        self.pulling.contains(&index)
    }

    pub fn mark_pulling(&mut self, index: usize) {
        self.pulling.insert(index);
    }

    /// Starts signature assembly on a working copy of the given tree's
    /// block.
    pub fn start_working_block(&mut self, tree_owner: &MemberId) -> bool {
        if self.working_block.is_some() {
            return true;
        }
        let block = self
            .forest
            .get(tree_owner)
            .and_then(|tree| tree.block.as_ref());
        match block {
            Some(block) => {
                self.working_block = Some(Block::clone(block));
                true
            }
            None => false,
        }
    }

    /// Appends a consensus signature to the working block's coinbase
    /// scripts.
    pub fn append_signature_script(&mut self, signature: Vec<u8>) {
        if let Some(block) = &mut self.working_block {
            block.signature_scripts.push(signature);
        }
    }

    /// Records that a member contributed a signature. Returns `true` for
    /// first-time signers.
    pub fn mark_signed(&mut self, index: usize) -> bool {
        if self.signed.get(index) == Some(true) {
            return false;
        }
        self.signed.set(index, true);
        self.signed_count += 1;
        true
    }

    pub fn signed_count(&self) -> usize {
        self.signed_count
    }

    /// A majority of members have contributed signatures.
    pub fn has_signature_quorum(&self) -> bool {
        self.signed_count > self.committee.len() / 2
    }

    /// Whether the working block is ready for the chain: it is assembled
    /// and a majority of members have contributed signatures. The script
    /// list then holds the coinbase push, the miner identity, and more than
    /// `⌊n/2⌋` consensus signatures.
    pub fn working_block_finalized(&self) -> bool {
        self.working_block.is_some() && self.has_signature_quorum()
    }

    /// Takes the assembled block for submission. The state never touches it
    /// again.
    pub fn take_working_block(&mut self) -> Option<Block> {
        self.working_block.take()
    }

    pub fn working_block(&self) -> Option<&Block> {
        self.working_block.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn member(byte: u8) -> MemberId {
        MemberId([byte; 20])
    }

    fn committee4() -> Committee {
        Committee::from_members(100, vec![member(0), member(1), member(2), member(3)])
    }

    fn tree(creator: MemberId, fees: u64, hash_byte: u8) -> CandidateTree {
        CandidateTree {
            creator,
            fees,
            hash: BlockHash([hash_byte; 32]),
            header: Some(BlockHeader::default()),
            block: Some(Arc::new(Block {
                signature_scripts: vec![vec![0; 8], creator.as_bytes().to_vec()],
                ..Block::default()
            })),
        }
    }

    fn state() -> SyncerState {
        SyncerState::new(Height(40), committee4(), member(3), 3)
    }

    #[test]
    fn committee_window_math() {
        let committee = committee4();
        assert_eq!(committee.len(), 4);
        assert_eq!(committee.base(), 100);
        assert_eq!(committee.index_of(&member(2)), Some(2));
        assert_eq!(committee.index_of(&member(9)), None);
        assert_eq!(committee.miner_height(3), 103);
    }

    #[test]
    fn better_prefers_fees_then_index() {
        let mut state = state();
        state.install_tree(tree(member(0), 100, 1));
        state.install_tree(tree(member(1), 200, 2));
        state.install_tree(tree(member(2), 200, 3));

        // Higher fees win.
        assert!(state.better(1, 0));
        assert!(!state.better(0, 1));
        // Equal fees break toward the higher index.
        assert!(state.better(2, 1));
        assert!(!state.better(1, 2));
        // Unknown tree always loses.
        assert!(!state.better(3, 0));
        assert!(state.better(0, 3));
    }

    #[test]
    fn conflicting_tree_is_detected() {
        let mut state = state();
        assert_eq!(state.install_tree(tree(member(0), 10, 1)), TreeInstall::Installed);
        assert_eq!(
            state.install_tree(tree(member(0), 10, 1)),
            TreeInstall::AlreadyKnown
        );
        assert_eq!(
            state.install_tree(tree(member(0), 10, 9)),
            TreeInstall::Conflict
        );

        state.register_malice(member(0));
        assert!(state.is_malicious(&member(0)));
        assert!(state.tree(&member(0)).is_none());
        assert_eq!(state.knowledge().all_known(0), 0);
    }

    #[test]
    fn placeholder_is_completed_by_the_block() {
        let mut state = state();
        state.install_placeholder(member(1), BlockHash([2; 32]));
        assert!(state.tree(&member(1)).unwrap().block.is_none());

        assert_eq!(state.install_tree(tree(member(1), 50, 2)), TreeInstall::Installed);
        assert!(state.tree(&member(1)).unwrap().block.is_some());
    }

    #[test]
    fn sig_latch_is_write_once() {
        let mut state = state();
        assert_eq!(state.sig_given(), None);
        state.set_sig_given(2);
        assert_eq!(state.sig_given(), Some(2));
        state.set_sig_given(2);
    }

    #[test]
    #[should_panic(expected = "sig_given latch")]
    fn sig_latch_rejects_rewrites() {
        let mut state = state();
        state.set_sig_given(2);
        state.set_sig_given(1);
    }

    #[test]
    fn signature_accounting() {
        let mut state = state();
        state.install_tree(tree(member(3), 10, 4));
        assert!(state.start_working_block(&member(3)));

        assert!(state.mark_signed(3));
        assert!(!state.mark_signed(3));
        state.append_signature_script(vec![1; 105]);
        assert!(!state.has_signature_quorum());

        // Two signers out of four are exactly half, not a majority.
        assert!(state.mark_signed(0));
        state.append_signature_script(vec![2; 105]);
        assert!(!state.has_signature_quorum());
        assert!(!state.working_block_finalized());

        assert!(state.mark_signed(1));
        state.append_signature_script(vec![3; 105]);
        assert!(state.has_signature_quorum());
        assert!(state.working_block_finalized());

        let block = state.take_working_block().unwrap();
        assert_eq!(block.signature_scripts.len(), 5);
        assert!(state.take_working_block().is_none());
    }
}
