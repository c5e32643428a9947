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

//! In-process sandbox driving several syncers over captured overlay queues.
//!
//! Every committee member runs a real [`Syncer`] whose overlay entries are
//! plain channels held by the sandbox. The pump alternates repeater passes
//! with message delivery until the network goes quiet, which mirrors how
//! the protocol converges in the absence of timing effects.

use futures::channel::mpsc;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    chain::{BestSnapshot, Block, BlockVerdict, ChainView, MinerBlock},
    consensus::{Syncer, SyncerEvent},
    crypto,
    events::{NetworkHandler, SharedConnectionPool},
    helpers::{BlockHash, Height, MemberId},
    invitation::Invitations,
    messages::{Candidate, Connect, ConsensusMessage, Message, Signature},
    overlay::CommitteeOverlay,
    state::{CandidateTree, Committee, SyncerState},
    Keys, NetworkConfiguration, NodeNotification,
};

const HEIGHT: Height = Height(41);
const N: usize = 4;
const QUEUE_CAPACITY: usize = 256;

struct SandboxChain {
    keys: HashMap<MemberId, SecretKey>,
    miners: Vec<MinerBlock>,
    processed: Mutex<Vec<Block>>,
}

impl ChainView for SandboxChain {
    fn best_snapshot(&self) -> BestSnapshot {
        BestSnapshot {
            height: Height(40),
            last_rotation: 103,
        }
    }

    fn miner_block_by_height(&self, height: u32) -> Option<MinerBlock> {
        self.miners.iter().find(|block| block.height == height).cloned()
    }

    fn block_by_hash(&self, _hash: &BlockHash) -> Option<Arc<Block>> {
        None
    }

    fn process_block(&self, block: Block) -> anyhow::Result<BlockVerdict> {
        self.processed.lock().unwrap().push(block);
        Ok(BlockVerdict {
            on_main_chain: true,
            orphan: false,
        })
    }

    fn signing_key(&self, member: &MemberId) -> Option<SecretKey> {
        self.keys.get(member).copied()
    }
}

struct Sandbox {
    chain: Arc<SandboxChain>,
    members: Vec<MemberId>,
    member_keys: Vec<SecretKey>,
    blocks: Vec<Arc<Block>>,
    nodes: Vec<Syncer>,
    finished: Vec<bool>,
    // outboxes[i][j]: messages node i queued for member j.
    outboxes: Vec<Vec<Option<mpsc::Receiver<Message>>>>,
    notifications: Vec<mpsc::Receiver<NodeNotification>>,
    secp: Secp256k1<secp256k1::All>,
}

impl Sandbox {
    /// Builds a four-member committee; member `i` mines a candidate block
    /// with the given fee total (divisible by four).
    fn new(fees: [u64; N]) -> Self {
        let secp = Secp256k1::new();
        let member_keys: Vec<SecretKey> =
            (0..N).map(|_| SecretKey::new(&mut rand::thread_rng())).collect();
        let members: Vec<MemberId> = member_keys
            .iter()
            .map(|key| crypto::member_id_for_pubkey(&PublicKey::from_secret_key(&secp, key)))
            .collect();

        let miners = members
            .iter()
            .enumerate()
            .map(|(index, &miner)| MinerBlock {
                height: 100 + index as u32,
                miner,
                connection: Vec::new(),
            })
            .collect();
        let chain = Arc::new(SandboxChain {
            keys: members
                .iter()
                .copied()
                .zip(member_keys.iter().copied())
                .collect(),
            miners,
            processed: Mutex::new(Vec::new()),
        });

        let blocks: Vec<Arc<Block>> = (0..N)
            .map(|index| {
                let mut block = Block {
                    signature_scripts: vec![vec![0; 8], members[index].as_bytes().to_vec()],
                    award_outputs: vec![fees[index] / N as u64; N],
                    ..Block::default()
                };
                block.header.nonce = index as i32;
                Arc::new(block)
            })
            .collect();

        let committee = Committee::from_members(100, members.clone());
        let mut nodes = Vec::with_capacity(N);
        let mut outboxes = Vec::with_capacity(N);
        let mut notifications = Vec::with_capacity(N);
        for index in 0..N {
            let overlay = test_overlay(chain.clone(), members[index], member_keys[index]);
            let mut row = Vec::with_capacity(N);
            for (peer, &member) in members.iter().enumerate() {
                if peer == index {
                    row.push(None);
                    continue;
                }
                let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
                overlay.insert_member_for_tests(member, 100 + peer as u32, queue_tx);
                row.push(Some(queue_rx));
            }
            outboxes.push(row);

            let mut state =
                SyncerState::new(HEIGHT, committee.clone(), members[index], index);
            state.set_runnable(true);
            let (notifications_tx, notifications_rx) = mpsc::channel(16);
            notifications.push(notifications_rx);
            nodes.push(Syncer::new(
                state,
                chain.clone() as Arc<dyn ChainView>,
                overlay,
                notifications_tx,
            ));
        }

        Self {
            chain,
            members,
            member_keys,
            blocks,
            nodes,
            finished: vec![false; N],
            outboxes,
            notifications,
            secp,
        }
    }

    fn tree(&self, index: usize) -> CandidateTree {
        CandidateTree {
            creator: self.members[index],
            fees: self.blocks[index].award_fees().unwrap(),
            hash: self.blocks[index].block_hash(),
            header: Some(self.blocks[index].header),
            block: Some(Arc::clone(&self.blocks[index])),
        }
    }

    /// Every member learns every candidate block through the block relay.
    fn deliver_all_trees(&mut self) {
        for node in 0..N {
            for tree in 0..N {
                let tree = self.tree(tree);
                self.deliver(node, SyncerEvent::NewTree(tree));
            }
        }
    }

    fn deliver(&mut self, node: usize, event: SyncerEvent) {
        if self.finished[node] {
            return;
        }
        if self.nodes[node].handle_event(event) {
            self.finished[node] = true;
            self.nodes[node].finish();
        }
    }

    /// Delivers every queued message once. Returns the number delivered.
    fn deliver_pending(&mut self) -> usize {
        let mut delivered = 0;
        for from in 0..N {
            for to in 0..N {
                let mut drained = Vec::new();
                if let Some(queue) = self.outboxes[from][to].as_mut() {
                    while let Ok(Some(message)) = queue.try_next() {
                        drained.push(message);
                    }
                }
                for message in drained {
                    if let Message::Consensus(msg) = message {
                        delivered += 1;
                        self.deliver(to, SyncerEvent::Message(msg));
                    }
                }
            }
        }
        delivered
    }

    /// Alternates repeater passes and delivery until the network is quiet.
    fn pump(&mut self) {
        for _ in 0..64 {
            for node in 0..N {
                if !self.finished[node] {
                    self.nodes[node].repeater_pass();
                }
            }
            if self.deliver_pending() == 0 {
                break;
            }
        }
    }

    /// Drains messages node `from` queued for member `to`.
    fn sent_messages(&mut self, from: usize, to: usize) -> Vec<Message> {
        let mut drained = Vec::new();
        if let Some(queue) = self.outboxes[from][to].as_mut() {
            while let Ok(Some(message)) = queue.try_next() {
                drained.push(message);
            }
        }
        drained
    }

    fn candidate_msg(&self, from: usize) -> Candidate {
        let hash = self.blocks[from].block_hash();
        let digest = crypto::sig_hash(HEIGHT, &hash);
        Candidate {
            height: HEIGHT,
            from: self.members[from],
            tree_hash: hash,
            signature: crypto::sign_consensus(&self.secp, &self.member_keys[from], digest),
        }
    }

    fn signature_msg(&self, from: usize, tree_owner: usize) -> Signature {
        let hash = self.blocks[tree_owner].block_hash();
        let digest = crypto::sig_hash(HEIGHT, &hash);
        Signature {
            height: HEIGHT,
            from: self.members[from],
            tree_hash: hash,
            signature: crypto::sign_consensus(&self.secp, &self.member_keys[from], digest),
            for_member: self.members[tree_owner],
        }
    }

    fn processed_blocks(&self) -> Vec<Block> {
        self.chain.processed.lock().unwrap().clone()
    }

    fn take_notifications(&mut self, node: usize) -> Vec<NodeNotification> {
        let mut drained = Vec::new();
        while let Ok(Some(notification)) = self.notifications[node].try_next() {
            drained.push(notification);
        }
        drained
    }
}

fn test_overlay(
    chain: Arc<SandboxChain>,
    our_id: MemberId,
    secret_key: SecretKey,
) -> CommitteeOverlay {
    let (network_tx, _network_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (requests_tx, _requests_rx) = mpsc::channel(QUEUE_CAPACITY);
    let keys = Keys {
        member_id: our_id,
        secret_key,
        rsa_key: None,
    };
    let handler = NetworkHandler::new(
        "127.0.0.1:0".parse().unwrap(),
        SharedConnectionPool::new(our_id),
        NetworkConfiguration::default(),
        network_tx,
        Connect {
            member: our_id,
            host: "127.0.0.1:0".to_owned(),
            time: 0,
        },
        1024 * 1024,
    );
    let invitations = Arc::new(Invitations::new(
        chain.clone() as Arc<dyn ChainView>,
        keys,
        "127.0.0.1:0".to_owned(),
        N as u32,
    ));
    CommitteeOverlay::new(
        handler,
        requests_tx,
        invitations,
        chain as Arc<dyn ChainView>,
        our_id,
        N as u32,
        Duration::from_millis(10),
    )
}

mod scenarios {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::messages::{Reply, BETTER_NOT_MEMBER, BETTER_UNQUALIFIED};

    /// Happy path: equal fees, the highest index wins, every member ends up
    /// signing the winner's block and the winner submits it.
    #[tokio::test]
    async fn happy_path_highest_index_wins() {
        let mut sandbox = Sandbox::new([100, 100, 100, 100]);
        sandbox.deliver_all_trees();
        sandbox.pump();

        let winner_hash = sandbox.blocks[3].block_hash();
        let processed = sandbox.processed_blocks();
        assert!(!processed.is_empty(), "no block was submitted");
        for block in &processed {
            assert_eq!(block.block_hash(), winner_hash);
            // Coinbase push, miner identity, and a signature majority.
            assert!(block.signature_scripts.len() > N / 2 + 2);
        }

        // The winner itself reached quorum and latched on its own tree.
        assert_eq!(sandbox.nodes[3].state().sig_given(), Some(3));
        assert!(sandbox.finished[3]);

        // Nobody signed more than one tree.
        for node in 0..N {
            let given = sandbox.nodes[node].state().sig_given();
            assert_eq!(given, Some(3), "node {} signed {:?}", node, given);
        }
    }

    /// Fee-weighted selection: one member outbids the rest.
    #[tokio::test]
    async fn highest_fees_win() {
        let mut sandbox = Sandbox::new([100, 400, 100, 100]);
        sandbox.deliver_all_trees();
        sandbox.pump();

        let winner_hash = sandbox.blocks[1].block_hash();
        let processed = sandbox.processed_blocks();
        assert!(!processed.is_empty(), "no block was submitted");
        for block in &processed {
            assert_eq!(block.block_hash(), winner_hash);
        }
    }

    /// Candidacy swap: an agreed candidate yields to a better announcement,
    /// releasing its consenters and consenting to the newcomer.
    #[tokio::test]
    async fn candidacy_swap_releases_agreers() {
        let mut sandbox = Sandbox::new([100, 400, 100, 100]);

        // A (index 0) learns its own tree and B's; D consented to A.
        sandbox.deliver(0, SyncerEvent::NewTree(sandbox.tree(0)));
        sandbox.deliver(0, SyncerEvent::NewTree(sandbox.tree(1)));
        sandbox.pump();

        // Saturate A's view of both trees so that both are qualified.
        let rows = [u64::MAX; N];
        sandbox.nodes[0]
            .state_mut_for_tests()
            .knowledge_mut()
            .proc_flat_knowledge(0, &rows);
        sandbox.nodes[0]
            .state_mut_for_tests()
            .knowledge_mut()
            .proc_flat_knowledge(1, &rows);

        // A announces itself and wins a consent from D.
        sandbox.nodes[0].state_mut_for_tests().set_agreed(Some(0));
        sandbox.nodes[0].state_mut_for_tests().add_asked(0);
        sandbox.nodes[0].state_mut_for_tests().add_agree(3);

        // B announces with strictly higher fees.
        let candidate = sandbox.candidate_msg(1);
        sandbox.deliver(0, SyncerEvent::Message(ConsensusMessage::Candidate(candidate)));

        assert_eq!(sandbox.nodes[0].state().agreed(), Some(1));
        assert!(!sandbox.nodes[0].state().asked().contains(&0));

        // D got a release, B got our consent.
        let to_d = sandbox.sent_messages(0, 3);
        assert!(to_d.iter().any(|msg| matches!(
            msg,
            Message::Consensus(ConsensusMessage::Release(release)) if release.better == 1
        )));
        let to_b = sandbox.sent_messages(0, 1);
        assert!(to_b.iter().any(|msg| matches!(
            msg,
            Message::Consensus(ConsensusMessage::CandidateResp(resp))
                if resp.reply == Reply::Consent && resp.better == 1
        )));
    }

    /// Missing tree: a candidate referencing an unknown tree gets a
    /// placeholder, a pull, and an unqualified rejection; once the block
    /// and knowledge arrive, re-announcement wins consent.
    #[tokio::test]
    async fn missing_tree_is_pulled_then_consented() {
        let mut sandbox = Sandbox::new([100, 100, 100, 100]);

        // C (index 2) has no idea about D's tree and receives D's
        // candidacy announcement.
        let candidate = sandbox.candidate_msg(3);
        sandbox.deliver(
            2,
            SyncerEvent::Message(ConsensusMessage::Candidate(candidate.clone())),
        );

        let placeholder = sandbox.nodes[2].state().tree(&sandbox.members[3]).cloned();
        let placeholder = placeholder.expect("placeholder tree installed");
        assert!(placeholder.block.is_none());
        assert_eq!(placeholder.hash, sandbox.blocks[3].block_hash());

        let to_d = sandbox.sent_messages(2, 3);
        assert!(to_d.iter().any(|msg| matches!(msg, Message::GetData(_))));
        assert!(to_d.iter().any(|msg| matches!(
            msg,
            Message::Consensus(ConsensusMessage::CandidateResp(resp))
                if resp.reply == Reply::Reject && resp.better == BETTER_UNQUALIFIED
        )));

        // The pulled block arrives and knowledge of D's tree saturates.
        sandbox.deliver(2, SyncerEvent::NewTree(sandbox.tree(3)));
        let rows = [u64::MAX; N];
        sandbox.nodes[2]
            .state_mut_for_tests()
            .knowledge_mut()
            .proc_flat_knowledge(3, &rows);

        // D asks again; C consents this time.
        sandbox.deliver(2, SyncerEvent::Message(ConsensusMessage::Candidate(candidate)));
        let to_d = sandbox.sent_messages(2, 3);
        assert!(to_d.iter().any(|msg| matches!(
            msg,
            Message::Consensus(ConsensusMessage::CandidateResp(resp))
                if resp.reply == Reply::Consent
        )));
        assert_eq!(sandbox.nodes[2].state().agreed(), Some(3));
    }

    /// Malice: two distinct trees from one creator disqualify the creator,
    /// and its later candidacy is rejected outright.
    #[tokio::test]
    async fn conflicting_trees_mark_creator_malicious() {
        let mut sandbox = Sandbox::new([100, 100, 100, 100]);

        sandbox.deliver(2, SyncerEvent::NewTree(sandbox.tree(0)));

        // A second, different tree from the same creator.
        let mut conflicting = Block::clone(&sandbox.blocks[0]);
        conflicting.header.nonce = 99;
        let conflicting = Arc::new(conflicting);
        sandbox.deliver(
            2,
            SyncerEvent::NewTree(CandidateTree {
                creator: sandbox.members[0],
                fees: 100,
                hash: conflicting.block_hash(),
                header: Some(conflicting.header),
                block: Some(conflicting),
            }),
        );

        let state = sandbox.nodes[2].state();
        assert!(state.is_malicious(&sandbox.members[0]));
        assert!(state.tree(&sandbox.members[0]).is_none());
        assert_eq!(state.knowledge().all_known(0), 0);

        // A candidacy from the malicious member is rejected.
        let candidate = sandbox.candidate_msg(0);
        sandbox.deliver(2, SyncerEvent::Message(ConsensusMessage::Candidate(candidate)));
        let to_a = sandbox.sent_messages(2, 0);
        assert!(to_a.iter().any(|msg| matches!(
            msg,
            Message::Consensus(ConsensusMessage::CandidateResp(resp))
                if resp.reply == Reply::Reject && resp.better == BETTER_NOT_MEMBER
        )));
    }

    /// Sets up D as its own signed candidate: consents from A and B, the
    /// consensus-reached procedure run, the signature latch engaged.
    fn signed_own_candidate(sandbox: &mut Sandbox) {
        sandbox.deliver(3, SyncerEvent::NewTree(sandbox.tree(3)));
        let rows = [u64::MAX; N];
        sandbox.nodes[3]
            .state_mut_for_tests()
            .knowledge_mut()
            .proc_flat_knowledge(3, &rows);
        sandbox.nodes[3].state_mut_for_tests().set_agreed(Some(3));
        sandbox.nodes[3].state_mut_for_tests().add_asked(3);
        sandbox.nodes[3].state_mut_for_tests().add_agree(0);
        sandbox.nodes[3].state_mut_for_tests().add_agree(1);

        sandbox.nodes[3].repeater_pass();
        assert_eq!(sandbox.nodes[3].state().sig_given(), Some(3));
    }

    /// Quit short of a majority: two signers out of four are exactly half,
    /// and the drain must not submit a half-signed block.
    #[tokio::test]
    async fn quit_refuses_submission_short_of_majority() {
        let mut sandbox = Sandbox::new([100, 100, 100, 100]);
        signed_own_candidate(&mut sandbox);

        // One contributory signature on top of D's own: no majority.
        let signature = sandbox.signature_msg(0, 3);
        sandbox.deliver(3, SyncerEvent::Message(ConsensusMessage::Signature(signature)));
        assert!(sandbox.processed_blocks().is_empty());

        // Supervisor quit: nothing is submitted.
        sandbox.nodes[3].finish();
        assert!(sandbox.processed_blocks().is_empty());
        assert!(sandbox.take_notifications(3).is_empty());
    }

    /// Quit with a quorum in hand: signatures collected during teardown
    /// complete a majority, and the drain submits the assembled block.
    #[tokio::test]
    async fn quit_submits_with_majority_in_hand() {
        let mut sandbox = Sandbox::new([100, 100, 100, 100]);
        signed_own_candidate(&mut sandbox);

        // Residual signatures from A and B reach a majority of three.
        let first = sandbox.signature_msg(0, 3);
        assert!(!sandbox.nodes[3].handle_signature(first));
        let second = sandbox.signature_msg(1, 3);
        assert!(sandbox.nodes[3].handle_signature(second));

        sandbox.nodes[3].finish();
        let processed = sandbox.processed_blocks();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].block_hash(), sandbox.blocks[3].block_hash());
        // Coinbase push, miner identity, and three signatures.
        assert!(processed[0].signature_scripts.len() > N / 2 + 2);
        assert!(sandbox.take_notifications(3).is_empty());
    }

    /// Single-sign safety: after the latch engages, a consensus declaration
    /// for a different tree does not produce a second signature.
    #[tokio::test]
    async fn sig_given_is_write_once() {
        let mut sandbox = Sandbox::new([100, 100, 100, 100]);
        sandbox.deliver(0, SyncerEvent::NewTree(sandbox.tree(0)));
        sandbox.deliver(0, SyncerEvent::NewTree(sandbox.tree(3)));

        let rows = [u64::MAX; N];
        sandbox.nodes[0]
            .state_mut_for_tests()
            .knowledge_mut()
            .proc_flat_knowledge(3, &rows);
        sandbox.nodes[0].state_mut_for_tests().set_agreed(Some(3));

        // D declares consensus; A signs D's tree.
        let digest = crypto::sig_hash(HEIGHT, &sandbox.blocks[3].block_hash());
        let consensus = crate::messages::Consensus {
            height: HEIGHT,
            from: sandbox.members[3],
            tree_hash: sandbox.blocks[3].block_hash(),
            signature: crypto::sign_consensus(&sandbox.secp, &sandbox.member_keys[3], digest),
        };
        sandbox.deliver(0, SyncerEvent::Message(ConsensusMessage::Consensus(consensus)));
        assert_eq!(sandbox.nodes[0].state().sig_given(), Some(3));

        // A rival declaration from B is ignored by the latch.
        let digest = crypto::sig_hash(HEIGHT, &sandbox.blocks[1].block_hash());
        let rival = crate::messages::Consensus {
            height: HEIGHT,
            from: sandbox.members[1],
            tree_hash: sandbox.blocks[1].block_hash(),
            signature: crypto::sign_consensus(&sandbox.secp, &sandbox.member_keys[1], digest),
        };
        sandbox.deliver(0, SyncerEvent::Message(ConsensusMessage::Consensus(rival)));
        assert_eq!(sandbox.nodes[0].state().sig_given(), Some(3));
    }

    /// Mangled signatures are dropped without effect on the sender.
    #[tokio::test]
    async fn mangled_signature_is_dropped() {
        let mut sandbox = Sandbox::new([100, 100, 100, 100]);
        sandbox.deliver(3, SyncerEvent::NewTree(sandbox.tree(3)));

        let mut signature = sandbox.signature_msg(0, 3);
        let last = signature.signature.len() - 1;
        signature.signature[last] ^= 0xff;
        sandbox.deliver(3, SyncerEvent::Message(ConsensusMessage::Signature(signature)));

        assert_eq!(sandbox.nodes[3].state().signed_count(), 0);
        assert!(!sandbox.nodes[3].state().is_malicious(&sandbox.members[0]));
    }
}
