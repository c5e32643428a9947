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

//! The per-height consensus state machine.
//!
//! One syncer handles one height: it collects candidate trees, propagates
//! knowledge about them until one member becomes qualified, converges on a
//! single candidate through announce/consent/yield, and gathers a signature
//! majority on the winner. The syncer quits when its block is submitted or
//! when the chain advances past its height.

use futures::{channel::mpsc, StreamExt};
use log::{error, info, trace, warn};
use secp256k1::{All, Secp256k1};
use tokio::{sync::oneshot, time::MissedTickBehavior};

use std::{sync::Arc, time::Duration};

use crate::{
    chain::{Block, ChainView},
    crypto,
    helpers::{BlockHash, MemberId},
    messages::{
        Candidate, CandidateResp, Consensus, ConsensusMessage, GetData, Knowledge, Message,
        Release, Reply, Signature, BETTER_NOT_MEMBER, BETTER_UNQUALIFIED,
    },
    overlay::CommitteeOverlay,
    state::{CandidateTree, SyncerState, TreeInstall},
    NodeNotification,
};

/// Interval of the repeater tick driving knowledge resends.
pub(crate) const REPEATER_INTERVAL: Duration = Duration::from_millis(200);

/// Idle repeater cycles before it switches to unconditional resending.
const REPEATER_IDLE_LIMIT: u32 = 2;

/// Inbound events of a syncer, processed in strict arrival order.
#[derive(Debug)]
pub(crate) enum SyncerEvent {
    /// A candidate tree for this height passed local validation.
    NewTree(CandidateTree),
    /// A consensus message from another member.
    Message(ConsensusMessage),
    /// The chain reached a new best height; a syncer created ahead of the
    /// tip becomes runnable once its height is next.
    ChainAdvanced(crate::helpers::Height),
}

/// Builds a candidate tree from a locally validated block.
///
/// Blocks without the miner identity script, with unbalanced award outputs,
/// or already carrying a signature majority (a finalized block re-entering
/// through the block subsystem) yield `None`.
pub(crate) fn tree_from_block(block: &Arc<Block>, committee_size: usize) -> Option<CandidateTree> {
    if block.signature_scripts.len() < 2 {
        error!(
            "candidate block does not carry enough signature scripts: {}",
            block.signature_scripts.len()
        );
        return None;
    }
    // A finalized block carries the coinbase push, the miner identity, and
    // a signature majority; anything past that count is not a candidate.
    if block.signature_scripts.len() > committee_size / 2 + 2 {
        info!("it is a consensus block, skip it");
        return None;
    }
    if block.award_outputs.len() <= committee_size / 2 {
        return None;
    }
    let creator = block.miner()?;
    let fees = block.award_fees()?;
    Some(CandidateTree {
        creator,
        fees,
        hash: block.block_hash(),
        header: Some(block.header),
        block: Some(Arc::clone(block)),
    })
}

/// The state machine task of one height.
pub(crate) struct Syncer {
    state: SyncerState,
    chain: Arc<dyn ChainView>,
    overlay: CommitteeOverlay,
    notifications: mpsc::Sender<NodeNotification>,
    secp: Secp256k1<All>,

    // Per-member accounting of received message kinds, dumped at trace
    // level with the rest of the state.
    knowledge_seen: Vec<bool>,
    candidates_seen: Vec<bool>,
    consensus_seen: Vec<bool>,
    repeater_idles: u32,
}

impl Syncer {
    pub fn new(
        state: SyncerState,
        chain: Arc<dyn ChainView>,
        overlay: CommitteeOverlay,
        notifications: mpsc::Sender<NodeNotification>,
    ) -> Self {
        let n = state.committee().len();
        Self {
            state,
            chain,
            overlay,
            notifications,
            secp: Secp256k1::new(),
            knowledge_seen: vec![false; n],
            candidates_seen: vec![false; n],
            consensus_seen: vec![false; n],
            repeater_idles: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &SyncerState {
        &self.state
    }

    #[cfg(test)]
    pub fn state_mut_for_tests(&mut self) -> &mut SyncerState {
        &mut self.state
    }

    /// Event loop: inbound events in FIFO order, the repeater tick in-line,
    /// prompt exit on quit. On exit residual signatures are drained and the
    /// block is submitted if a quorum is already in hand.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SyncerEvent>,
        mut quit: oneshot::Receiver<()>,
    ) {
        let mut tick = tokio::time::interval(REPEATER_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let finished = tokio::select! {
                _ = &mut quit => break,
                event = events.next() => match event {
                    None => break,
                    Some(event) => self.handle_event(event),
                },
                _ = tick.tick() => {
                    self.repeater_pass();
                    false
                }
            };
            if finished {
                break;
            }
        }

        self.drain(&mut events);
    }

    /// Processes one inbound event. Returns `true` once a signature quorum
    /// completes the height.
    pub(crate) fn handle_event(&mut self, event: SyncerEvent) -> bool {
        let finished = match event {
            SyncerEvent::NewTree(tree) => {
                self.handle_new_tree(tree);
                false
            }
            SyncerEvent::Message(msg) => {
                trace!("processing {} message", Message::from(msg.clone()).command());
                self.handle_message(msg)
            }
            SyncerEvent::ChainAdvanced(best) => {
                if !self.state.is_runnable() && self.state.height() == best.next() {
                    info!("consensus runnable at {}", self.state.height());
                    self.state.set_runnable(true);
                }
                false
            }
        };
        self.log_state();
        finished
    }

    fn handle_message(&mut self, msg: ConsensusMessage) -> bool {
        // The signature latch freezes everything but signature collection.
        let latched = self.state.sig_given().is_some();
        match msg {
            ConsensusMessage::Knowledge(msg) if !latched => self.handle_knowledge(msg),
            ConsensusMessage::Candidate(msg) if !latched => self.handle_candidate(msg),
            ConsensusMessage::CandidateResp(msg) if !latched => self.handle_candidate_resp(msg),
            ConsensusMessage::Release(msg) if !latched => self.handle_release(msg),
            ConsensusMessage::Consensus(msg) if !latched => self.handle_consensus(msg),
            ConsensusMessage::Signature(msg) => return self.handle_signature(msg),
            _ => {}
        }
        false
    }

    /// Validates a message referencing `finder`'s tree. Unknown trees are
    /// installed as placeholders and pulled; a hash conflicting with the
    /// registered tree invalidates the message.
    fn validate_msg(&mut self, finder: MemberId, tree_hash: Option<BlockHash>) -> bool {
        if self.state.is_malicious(&finder) {
            info!("validate failed, {} is a malicious node", finder);
            return false;
        }
        let index = match self.state.committee().index_of(&finder) {
            Some(index) => index,
            None => {
                info!("validate failed, {} is not a member", finder);
                return false;
            }
        };

        if let Some(hash) = tree_hash {
            match self.state.tree(&finder) {
                None => {
                    self.state.install_placeholder(finder, hash);
                    info!("pull block {} from {}", hash, index);
                    self.pull(hash, index);
                    return true;
                }
                Some(tree) if tree.hash != hash => {
                    info!("block is not the same as registered {}", tree.hash);
                    return false;
                }
                Some(_) => {}
            }
        }
        true
    }

    pub(crate) fn handle_new_tree(&mut self, tree: CandidateTree) {
        if self.state.sig_given().is_some() {
            return;
        }
        info!("newtree {} at {}", tree.hash, self.state.height());
        if !self.validate_msg(tree.creator, None) {
            info!("tree creator {} is not usable", tree.creator);
            return;
        }

        let creator = tree.creator;
        let hash = tree.hash;
        match self.state.install_tree(tree) {
            TreeInstall::Conflict => {
                if creator == self.state.our_id() {
                    error!(
                        "incorrect tree, generated duplicate tree hash at {}",
                        self.state.height()
                    );
                    return;
                }
                self.state.register_malice(creator);
                return;
            }
            TreeInstall::Installed => {
                if let Some(index) = self.state.committee().index_of(&creator) {
                    self.state.knowledge_mut().init_tree(index);
                }
            }
            TreeInstall::AlreadyKnown => {}
        }

        if creator == self.state.our_id() {
            let knowledge = Knowledge::with_path(
                self.state.our_id(),
                self.state.our_id(),
                self.state.height(),
                hash,
                vec![self.state.our_index() as i64],
            );
            self.handle_knowledge(knowledge);
        }
        self.log_state();
    }

    fn handle_knowledge(&mut self, msg: Knowledge) {
        let committee_len = self.state.committee().len();
        if let Some(index) = self.state.committee().index_of(&msg.from) {
            self.knowledge_seen[index] = true;
        }
        trace!(
            "knowledge: finder={} from={} height={} tree={} k={:?}",
            msg.finder,
            msg.from,
            msg.height,
            msg.tree_hash,
            msg.k
        );

        if !self.validate_msg(msg.finder, Some(msg.tree_hash)) {
            info!("knowledge message invalid");
            return;
        }
        let finder = match self.state.committee().index_of(&msg.finder) {
            Some(index) => index,
            None => return,
        };
        let from = match self.state.committee().index_of(&msg.from) {
            Some(index) => index,
            None => return,
        };

        if let Some(rows) = msg.flat_rows() {
            if self.state.knowledge_mut().proc_flat_knowledge(finder, &rows) {
                self.candidacy();
            }
            return;
        }

        let path = match as_indices(msg.path(), committee_len) {
            Some(path) => path,
            None => return,
        };
        self.state.record_knowledge(msg);
        if self.state.knowledge_mut().proc_knowledge(finder, from, &path) {
            self.candidacy();
        }
    }

    /// Announces our candidacy when our tree is qualified and no better
    /// qualified candidate has asked.
    fn candidacy(&mut self) {
        let me = self.state.our_index();
        if matches!(self.state.agreed(), Some(agreed) if agreed != me)
            || !self.state.knowledge().qualified(me)
        {
            return;
        }
        let our_hash = match self.state.our_tree() {
            Some(tree) => tree.hash,
            None => return,
        };

        let mut better = me;
        for index in 0..self.state.committee().len() {
            if self.state.asked().contains(&index)
                && self.state.better(index, better)
                && self.state.knowledge().qualified(index)
            {
                // Someone else is the best choice; defer to them.
                better = index;
            }
        }
        if better != me {
            let missing = self
                .state
                .tree_by_index(better)
                .map_or(None, |tree| if tree.block.is_none() { Some(tree.hash) } else { None });
            if let Some(hash) = missing {
                self.pull(hash, better);
            }
            return;
        }

        let signature = match self.sign_tree_hash(our_hash) {
            Some(signature) => signature,
            None => return,
        };

        self.state.set_agreed(Some(me));
        self.state.add_asked(me);
        info!("announce candidacy by {}", me);

        let msg = Candidate {
            height: self.state.height(),
            from: self.state.our_id(),
            tree_hash: our_hash,
            signature,
        };
        self.overlay.broadcast(
            &Message::from(ConsensusMessage::Candidate(msg)),
            Some(&self.state.our_id()),
        );
    }

    pub(crate) fn handle_candidate(&mut self, msg: Candidate) {
        if let Some(index) = self.state.committee().index_of(&msg.from) {
            self.candidates_seen[index] = true;
        }

        // The candidate signature must bind the announcement to the sender.
        let digest = crypto::sig_hash(msg.height, &msg.tree_hash);
        match crypto::verify_consensus(digest, &msg.signature) {
            Ok(pubkey) if crypto::member_id_for_pubkey(&pubkey) == msg.from => {}
            Ok(_) | Err(_) => {
                trace!("dropping candidate with unusable signature");
                return;
            }
        }

        let from_index = self.state.committee().index_of(&msg.from);
        let usable = from_index.is_some()
            && self.state.is_runnable()
            && !self.state.is_malicious(&msg.from);
        if !usable {
            self.reply(
                msg.from,
                Reply::Reject,
                BETTER_NOT_MEMBER,
                msg.tree_hash,
            );
            return;
        }
        let from_index = from_index.unwrap();
        self.state.add_asked(from_index);

        let needs_block = match self.state.tree(&msg.from) {
            None => {
                self.state.install_placeholder(msg.from, msg.tree_hash);
                true
            }
            Some(tree) => tree.block.is_none(),
        };
        if needs_block {
            self.pull(msg.tree_hash, from_index);
        }

        if self.state.sig_given().is_some() {
            // Should never be here; the latch gates the dispatcher.
            return;
        }

        if !self.state.knowledge().qualified(from_index) {
            self.reply(msg.from, Reply::Reject, BETTER_UNQUALIFIED, msg.tree_hash);
            return;
        }

        if let Some(agreed) = self.state.agreed() {
            if self.state.better(from_index, agreed) && self.try_yield(from_index) {
                // Yield already consented on our behalf.
                return;
            }
        }

        if self.state.agreed().is_none() || self.state.agreed() == Some(from_index) {
            info!("consent given by {} to {}", self.state.our_id(), from_index);
            self.state.set_agreed(Some(from_index));
            self.reply(msg.from, Reply::Consent, from_index as i32, msg.tree_hash);
            return;
        }

        // Reject and tell the sender who we agreed to; if they are not
        // actually better, push our knowledge of the agreed tree to them.
        let agreed = self.state.agreed().unwrap();
        if self.state.better(agreed, from_index) {
            self.dup_knowledge(from_index);
        }
        let agreed_hash = self
            .state
            .tree_by_index(agreed)
            .map_or_else(BlockHash::zero, |tree| tree.hash);
        self.reply(msg.from, Reply::Reject, agreed as i32, agreed_hash);
    }

    pub(crate) fn handle_candidate_resp(&mut self, msg: CandidateResp) {
        if !self.validate_msg(msg.from, None) {
            return;
        }
        let from_index = match self.state.committee().index_of(&msg.from) {
            Some(index) => index,
            None => return,
        };
        let me = self.state.our_index();

        match msg.reply {
            Reply::Consent => {
                if self.state.agreed() == Some(me) {
                    info!("consent received from {}", msg.from);
                    self.state.add_agree(from_index);
                    self.check_consensus();
                } else {
                    // We have changed our mind; release the consenter.
                    info!("consent received from {} but not taking it", msg.from);
                    let release = self.make_release(self.state.agreed());
                    self.send_to(msg.from, ConsensusMessage::Release(release));
                }
            }
            Reply::Reject if self.state.agreed() == Some(me) => {
                info!("rejection received from {}", msg.from);
                match msg.better {
                    BETTER_NOT_MEMBER => {}
                    BETTER_UNQUALIFIED => self.dup_knowledge(from_index),
                    better if better >= 0 && (better as usize) < self.state.committee().len() => {
                        let better = better as usize;
                        let missing = self
                            .state
                            .tree_by_index(better)
                            .map_or(true, |tree| tree.block.is_none());
                        if missing {
                            self.pull(msg.tree_hash, better);
                            return;
                        }
                        if !self.try_yield(better) {
                            // We are actually better; spread the word and
                            // re-announce.
                            self.dup_knowledge(from_index);
                            if self.state.agreed() == Some(me) {
                                self.reannounce();
                            }
                        }
                    }
                    _ => {}
                }
            }
            Reply::Reject => {}
        }
    }

    fn reannounce(&mut self) {
        let our_hash = match self.state.our_tree() {
            Some(tree) => tree.hash,
            None => return,
        };
        let signature = match self.sign_tree_hash(our_hash) {
            Some(signature) => signature,
            None => return,
        };
        let msg = Candidate {
            height: self.state.height(),
            from: self.state.our_id(),
            tree_hash: our_hash,
            signature,
        };
        self.overlay.broadcast(
            &Message::from(ConsensusMessage::Candidate(msg)),
            Some(&self.state.our_id()),
        );
    }

    /// Yields to a better candidate: releases our consenters, and consents
    /// to the better candidate if it has asked. Returns whether the yield
    /// happened.
    fn try_yield(&mut self, better: usize) -> bool {
        let agreed = match self.state.agreed() {
            Some(agreed) => agreed,
            None => return false,
        };
        if !self.state.better(better, agreed) {
            return false;
        }

        self.state.remove_asked(self.state.our_index());
        let release = self.make_release(Some(better));
        for agree in self.state.clear_agrees() {
            let member = self.state.committee().member(agree);
            self.send_to(member, ConsensusMessage::Release(release.clone()));
        }
        self.state.set_agreed(None);

        if self.state.asked().contains(&better) {
            let member = self.state.committee().member(better);
            let hash = self
                .state
                .tree_by_index(better)
                .map_or_else(BlockHash::zero, |tree| tree.hash);
            self.state.set_agreed(Some(better));
            let resp = CandidateResp {
                height: self.state.height(),
                from: self.state.our_id(),
                reply: Reply::Consent,
                better: better as i32,
                tree_hash: hash,
                k: Vec::new(),
            };
            self.send_to(member, ConsensusMessage::CandidateResp(resp));
        }
        true
    }

    fn make_release(&self, better: Option<usize>) -> Release {
        let (better_index, hash, k) = match better {
            Some(better) => {
                let hash = self
                    .state
                    .tree_by_index(better)
                    .map_or_else(BlockHash::zero, |tree| tree.hash);
                let rows = self.state.knowledge().rows(better);
                let knowledge = Knowledge::flat(
                    self.state.committee().member(better),
                    self.state.our_id(),
                    self.state.height(),
                    hash,
                    rows,
                );
                (better as i32, hash, knowledge.k)
            }
            None => (BETTER_NOT_MEMBER, BlockHash::zero(), Vec::new()),
        };
        Release {
            height: self.state.height(),
            from: self.state.our_id(),
            better: better_index,
            tree_hash: hash,
            k,
        }
    }

    pub(crate) fn handle_release(&mut self, msg: Release) {
        if !self.validate_msg(msg.from, None) {
            return;
        }
        let from_index = match self.state.committee().index_of(&msg.from) {
            Some(index) => index,
            None => return,
        };
        self.state.remove_asked(from_index);

        if self.state.agreed() != Some(from_index) {
            return;
        }
        if msg.better >= 0 && (msg.better as usize) < self.state.committee().len() {
            let better = msg.better as usize;
            let rows = flat_rows(&msg.k);
            self.state.knowledge_mut().proc_flat_knowledge(better, &rows);
            if self.state.tree_by_index(better).is_none() {
                let member = self.state.committee().member(better);
                self.state.install_placeholder(member, msg.tree_hash);
                self.pull(msg.tree_hash, better);
            }
        }
        self.state.set_agreed(None);
    }

    /// Runs the consensus-reached procedure once a consent majority exists:
    /// sign our own tree, latch, and broadcast the consensus declaration.
    fn check_consensus(&mut self) {
        let me = self.state.our_index();
        let n = self.state.committee().len();
        if self.state.agreed() != Some(me) || self.state.agrees().len() + 1 <= n / 2 {
            return;
        }
        let our_hash = match self.state.our_tree() {
            Some(tree) if tree.block.is_some() => tree.hash,
            _ => return,
        };
        if self.state.sig_given().is_some() {
            return;
        }
        let signature = match self.sign_tree_hash(our_hash) {
            Some(signature) => signature,
            None => return,
        };

        self.state.set_sig_given(me);
        let our_id = self.state.our_id();
        self.state.start_working_block(&our_id);
        self.state.append_signature_script(signature.clone());
        self.state.mark_signed(me);

        let msg = Consensus {
            height: self.state.height(),
            from: self.state.our_id(),
            tree_hash: our_hash,
            signature,
        };
        self.overlay.broadcast(
            &Message::from(ConsensusMessage::Consensus(msg)),
            Some(&self.state.our_id()),
        );
    }

    pub(crate) fn handle_consensus(&mut self, msg: Consensus) {
        if let Some(index) = self.state.committee().index_of(&msg.from) {
            self.consensus_seen[index] = true;
        }
        if !self.validate_msg(msg.from, None) {
            return;
        }
        let from_index = match self.state.committee().index_of(&msg.from) {
            Some(index) => index,
            None => return,
        };
        if self.state.agreed() != Some(from_index) || self.state.sig_given().is_some() {
            return;
        }

        // Verify against the registered tree of the announcer, not the hash
        // inside the message.
        let tree_hash = match self.state.tree(&msg.from) {
            Some(tree) => tree.hash,
            None => return,
        };
        let digest = crypto::sig_hash(self.state.height(), &tree_hash);
        match crypto::verify_consensus(digest, &msg.signature) {
            Ok(pubkey) if crypto::member_id_for_pubkey(&pubkey) == msg.from => {}
            Ok(_) | Err(_) => return,
        }

        let our_signature = match self.sign_tree_hash(tree_hash) {
            Some(signature) => signature,
            None => return,
        };
        self.state.set_sig_given(from_index);

        let sig_msg = Signature {
            height: self.state.height(),
            from: self.state.our_id(),
            tree_hash,
            signature: our_signature.clone(),
            for_member: msg.from,
        };
        self.overlay.broadcast(
            &Message::from(ConsensusMessage::Signature(sig_msg)),
            Some(&self.state.our_id()),
        );

        if self
            .state
            .tree(&msg.from)
            .map_or(false, |tree| tree.block.is_some())
        {
            self.state.start_working_block(&msg.from);
            self.state.append_signature_script(msg.signature);
            self.state.append_signature_script(our_signature);
            self.state.mark_signed(from_index);
            self.state.mark_signed(self.state.our_index());
        }
    }

    /// Collects a contributory signature. Returns `true` when a majority of
    /// members have signed and the block can be submitted.
    pub(crate) fn handle_signature(&mut self, msg: Signature) -> bool {
        let tree_index = self.state.committee().index_of(&msg.for_member).filter(|_| {
            self.state
                .tree(&msg.for_member)
                .map_or(false, |tree| tree.hash == msg.tree_hash && tree.block.is_some())
        });
        let tree_index = match tree_index {
            Some(index) => index,
            None => {
                info!("signature ignored, no matching tree for {}", msg.tree_hash);
                return false;
            }
        };
        if let Some(given) = self.state.sig_given() {
            if given != tree_index {
                info!(
                    "signature ignored, it is for {}, not what I gave {}",
                    tree_index, given
                );
                return false;
            }
        }
        let from_index = match self.state.committee().index_of(&msg.from) {
            Some(index) => index,
            None => return false,
        };

        let digest = crypto::sig_hash(self.state.height(), &msg.tree_hash);
        match crypto::verify_consensus(digest, &msg.signature) {
            Ok(pubkey) if crypto::member_id_for_pubkey(&pubkey) == msg.from => {}
            Ok(_) | Err(_) => return false,
        }

        self.state.set_sig_given(tree_index);
        self.state.start_working_block(&msg.for_member);
        if self.state.mark_signed(from_index) {
            self.state.append_signature_script(msg.signature);
        }
        self.state.has_signature_quorum()
    }

    /// Pushes cached knowledge about our agreed tree to one member, each
    /// message extended by our own hop.
    fn dup_knowledge(&mut self, to: usize) {
        let agreed = match self.state.agreed() {
            Some(agreed) => agreed,
            None => return,
        };
        let agreed_id = self.state.committee().member(agreed);
        let me = self.state.our_index();
        let to_id = self.state.committee().member(to);

        let cached: Vec<Knowledge> = self.state.cached_knowledge(&agreed_id).to_vec();
        let mut relayed = Vec::new();
        for msg in cached {
            if msg.is_flat() || msg.path().last() == Some(&(to as i64)) {
                continue;
            }
            let mut bits = (1 << to) | (1 << me);
            for &hop in msg.path() {
                bits |= 1 << hop as u64;
            }
            // Skip messages the target would learn nothing from.
            let known = self.state.knowledge().rows(agreed)[to];
            if known | bits == known {
                continue;
            }

            let extended = msg.extended(self.state.our_id(), me);
            let send = self.overlay.send(
                &to_id,
                Message::from(ConsensusMessage::Knowledge(extended.clone())),
            );
            if send.is_ok() {
                self.state.knowledge_mut().record_sent(agreed, to, bits);
                relayed.push(delivery_echo(&extended, to_id, to));
            }
        }
        for msg in relayed {
            self.state.record_knowledge(msg);
        }
    }

    /// One repeater cycle: close per-peer gaps in the knowledge of our own
    /// tree, then re-check candidacy and the consensus condition. After
    /// [`REPEATER_IDLE_LIMIT`] idle cycles the resend becomes unconditional.
    pub(crate) fn repeater_pass(&mut self) {
        let me = self.state.our_index();
        let me_id = self.state.our_id();
        let n = self.state.committee().len();

        let all = self.state.knowledge().all_known(me);
        if all == 0 {
            return;
        }

        let mut sent = false;
        for peer in 0..n {
            if peer == me {
                continue;
            }
            let row = self.state.knowledge().rows(me)[peer];
            if row == all {
                continue;
            }
            let mut gap = row ^ all;

            let cached: Vec<Knowledge> = self.state.cached_knowledge(&me_id).to_vec();
            for msg in cached {
                if msg.is_flat() {
                    continue;
                }
                let mut bits = (1 << me) | (1 << peer);
                for &hop in msg.path() {
                    bits |= 1 << hop as u64;
                }
                if gap & bits != 0 && msg.path().last() != Some(&(peer as i64)) {
                    self.relay_to(peer, &msg, bits);
                    gap &= !bits;
                    sent = true;
                    if gap == 0 {
                        break;
                    }
                }
            }
        }

        let free_or_self = match self.state.agreed() {
            None => true,
            Some(agreed) => agreed == me,
        };
        if self.state.knowledge().qualified(me) && free_or_self {
            self.candidacy();
            self.check_consensus();
        } else if !sent {
            self.repeater_idles += 1;
        }

        if self.repeater_idles > REPEATER_IDLE_LIMIT {
            // Force resends; peers that missed earlier rounds get everything
            // we have about our own tree.
            for peer in 0..n {
                if peer == me {
                    continue;
                }
                let cached: Vec<Knowledge> = self.state.cached_knowledge(&me_id).to_vec();
                for msg in cached {
                    if msg.is_flat() || msg.path().last() == Some(&(peer as i64)) {
                        continue;
                    }
                    let mut bits = (1 << me) | (1 << peer);
                    for &hop in msg.path() {
                        bits |= 1 << hop as u64;
                    }
                    self.relay_to(peer, &msg, bits);
                }
            }
        }
    }

    fn relay_to(&mut self, peer: usize, msg: &Knowledge, bits: u64) {
        let me = self.state.our_index();
        let peer_id = self.state.committee().member(peer);
        let extended = msg.extended(self.state.our_id(), me);
        let send = self.overlay.send(
            &peer_id,
            Message::from(ConsensusMessage::Knowledge(extended.clone())),
        );
        if send.is_ok() {
            self.state.knowledge_mut().record_sent(me, peer, bits);
            // The delivery echo: the queued transfer will reach the peer,
            // so the extended path ending at the peer becomes a fact worth
            // relaying to everyone else.
            let echo = delivery_echo(&extended, peer_id, peer);
            self.state.record_knowledge(echo);
        }
    }

    /// Requests a tree's block from the member that referenced it, at most
    /// once per member.
    fn pull(&mut self, hash: BlockHash, from: usize) {
        if self.state.is_pulling(from) {
            trace!("already pulling from {} at {}", from, self.state.height());
            return;
        }
        let member = self.state.committee().member(from);
        let msg = Message::GetData(GetData {
            height: self.state.height(),
            tree_hash: hash,
        });
        if self.overlay.send(&member, msg).is_ok() {
            self.state.mark_pulling(from);
        } else {
            info!("failed to send pull request to {}", member);
        }
    }

    fn reply(&mut self, to: MemberId, reply: Reply, better: i32, tree_hash: BlockHash) {
        let resp = CandidateResp {
            height: self.state.height(),
            from: self.state.our_id(),
            reply,
            better,
            tree_hash,
            k: Vec::new(),
        };
        self.send_to(to, ConsensusMessage::CandidateResp(resp));
    }

    fn send_to(&mut self, to: MemberId, msg: ConsensusMessage) {
        if let Err(err) = self.overlay.send(&to, Message::from(msg)) {
            warn!("cannot reach member: {}", err);
        }
    }

    fn sign_tree_hash(&self, hash: BlockHash) -> Option<Vec<u8>> {
        let key = self.chain.signing_key(&self.state.our_id())?;
        let digest = crypto::sig_hash(self.state.height(), &hash);
        Some(crypto::sign_consensus(&self.secp, &key, digest))
    }

    /// Quit-drain: process residual signatures, then submit the block if a
    /// quorum of signature scripts is already assembled.
    fn drain(&mut self, events: &mut mpsc::Receiver<SyncerEvent>) {
        while let Ok(Some(event)) = events.try_next() {
            if let SyncerEvent::Message(ConsensusMessage::Signature(msg)) = event {
                info!("handling signature on quit");
                self.handle_signature(msg);
            }
        }
        self.finish();
    }

    pub(crate) fn finish(&mut self) {
        if self.state.sig_given().is_some()
            && self.state.is_runnable()
            && self.state.working_block_finalized()
        {
            self.submit_block();
        }
        self.state.set_done();
        info!("sync {} quit", self.state.height());
    }

    fn submit_block(&mut self) {
        let block = match self.state.take_working_block() {
            Some(block) => block,
            None => return,
        };
        let hash = block.block_hash();
        let height = self.state.height();
        info!("submitting finalized block {} at {}", hash, height);

        let accepted = match self.chain.process_block(block) {
            Ok(verdict) => {
                if verdict.on_main_chain && !verdict.orphan {
                    info!(
                        "consensus reached at {}, sigs = {}",
                        height,
                        self.state.signed_count()
                    );
                    true
                } else {
                    false
                }
            }
            Err(err) => {
                info!("consensus failed to process block: {}", err);
                false
            }
        };
        if !accepted {
            let notification = NodeNotification::BlockRejected { height, hash };
            self.notifications.try_send(notification).ok();
        }
    }

    fn log_state(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        trace!(
            "syncer {} = {}: runnable={} agreed={:?} sig_given={:?} agrees={:?} asked={:?} signed={}",
            self.state.our_index(),
            self.state.our_id(),
            self.state.is_runnable(),
            self.state.agreed(),
            self.state.sig_given(),
            self.state.agrees(),
            self.state.asked(),
            self.state.signed_count(),
        );
        trace!(
            "knowledge received from {:?}, candidacy from {:?}, consensus from {:?}",
            self.knowledge_seen,
            self.candidates_seen,
            self.consensus_seen,
        );
    }
}

/// A knowledge message as cached after a successful relay: the recipient is
/// on the path now, so the message documents their awareness for later
/// relays to other members.
fn delivery_echo(extended: &Knowledge, recipient: MemberId, recipient_index: usize) -> Knowledge {
    let mut echo = extended.clone();
    echo.from = recipient;
    echo.k.push(recipient_index as i64);
    echo
}

/// Converts a wire path into member indices, rejecting out-of-range hops.
fn as_indices(path: &[i64], committee_len: usize) -> Option<Vec<usize>> {
    path.iter()
        .map(|&hop| {
            if hop >= 0 && (hop as usize) < committee_len {
                Some(hop as usize)
            } else {
                None
            }
        })
        .collect()
}

/// Extracts the row vector from a release's knowledge payload, tolerating
/// the flat-matrix sentinel in first position.
fn flat_rows(k: &[i64]) -> Vec<u64> {
    let rows = match k.first() {
        Some(&crate::messages::FLAT_KNOWLEDGE_SENTINEL) => &k[1..],
        _ => k,
    };
    rows.iter().map(|&row| row as u64).collect()
}
