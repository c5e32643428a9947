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

//! Lifecycle owner of per-height syncers.
//!
//! The supervisor reacts to chain notifications (committee rotation, height
//! advance), creates a syncer when the first candidate block for a height
//! arrives, routes inbound consensus traffic to the right syncer, and reaps
//! syncers whose height the chain has passed.

use futures::channel::mpsc;
use log::{info, trace, warn};
use tokio::sync::oneshot;

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use crate::{
    chain::{ChainEvent, ChainView},
    consensus::{tree_from_block, Syncer, SyncerEvent},
    events::{Event, EventHandler, NetworkEvent, NetworkHandler, NetworkRequest},
    helpers::Height,
    invitation::{InvitationAction, Invitations},
    messages::{ConsensusMessage, Message},
    overlay::CommitteeOverlay,
    state::{Committee, SyncerState},
    Keys, NodeNotification,
};

/// Size of a syncer's inbound event queue.
fn syncer_queue_capacity(committee_size: u32) -> usize {
    committee_size as usize * 3
}

struct SyncerHandle {
    events: mpsc::Sender<SyncerEvent>,
    quit: Option<oneshot::Sender<()>>,
}

/// Supervisor of the consensus subsystem; runs as the node's handler task.
pub(crate) struct ConsensusSupervisor {
    chain: Arc<dyn ChainView>,
    overlay: CommitteeOverlay,
    invitations: Arc<Invitations>,
    network: NetworkHandler,
    network_requests: mpsc::Sender<NetworkRequest>,
    notifications: mpsc::Sender<NodeNotification>,
    keys: Keys,
    committee_size: u32,

    syncers: HashMap<i32, SyncerHandle>,
    // Messages for heights whose syncer does not exist yet, bounded per
    // height.
    stash: HashMap<i32, VecDeque<ConsensusMessage>>,
    last_rotation: u32,
}

impl ConsensusSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainView>,
        overlay: CommitteeOverlay,
        invitations: Arc<Invitations>,
        network: NetworkHandler,
        network_requests: mpsc::Sender<NetworkRequest>,
        notifications: mpsc::Sender<NodeNotification>,
        keys: Keys,
        committee_size: u32,
    ) -> Self {
        let last_rotation = chain.best_snapshot().last_rotation;
        Self {
            chain,
            overlay,
            invitations,
            network,
            network_requests,
            notifications,
            keys,
            committee_size,
            syncers: HashMap::new(),
            stash: HashMap::new(),
            last_rotation,
        }
    }

    /// Sets up the overlay for the current committee window. Called once on
    /// startup; later windows arrive through rotation events.
    pub fn initialize(&mut self) {
        self.overlay.rotate(self.last_rotation);
    }

    pub(crate) fn chain(&self) -> &dyn ChainView {
        self.chain.as_ref()
    }

    pub(crate) fn notifications(&mut self) -> &mut mpsc::Sender<NodeNotification> {
        &mut self.notifications
    }

    fn handle_chain_event(&mut self, event: ChainEvent) {
        match event {
            ChainEvent::BlockConnected {
                height,
                last_rotation,
            } => self.handle_block_connected(height, last_rotation),
            ChainEvent::CandidateBlock { height, block } => {
                let tree = match tree_from_block(&block, self.committee_size as usize) {
                    Some(tree) => tree,
                    None => return,
                };
                info!(
                    "candidate block {} initialized at {}, sending to its syncer",
                    tree.hash, height
                );
                if let Some(handle) = self.ensure_syncer(height) {
                    if handle.events.try_send(SyncerEvent::NewTree(tree)).is_err() {
                        warn!("syncer {} cannot keep up with candidate blocks", height);
                    }
                }
            }
        }
    }

    fn handle_block_connected(&mut self, height: Height, last_rotation: u32) {
        if last_rotation > self.last_rotation {
            self.last_rotation = last_rotation;
            self.overlay.rotate(last_rotation);
        }

        // Reap syncers the chain has passed; each drains residual
        // signatures and submits if it already holds a quorum.
        let heights: Vec<i32> = self
            .syncers
            .keys()
            .copied()
            .filter(|&h| h <= height.0)
            .collect();
        for h in heights {
            if let Some(mut handle) = self.syncers.remove(&h) {
                info!("retiring syncer for height {}", h);
                if let Some(quit) = handle.quit.take() {
                    quit.send(()).ok();
                }
            }
        }
        self.stash.retain(|&h, _| h > height.0);

        // A syncer created ahead of the tip becomes eligible now.
        if let Some(handle) = self.syncers.get_mut(&(height.0 + 1)) {
            handle
                .events
                .try_send(SyncerEvent::ChainAdvanced(height))
                .ok();
        }
    }

    /// Returns the syncer for a height, creating and starting it if the
    /// local node is in the current committee.
    fn ensure_syncer(&mut self, height: Height) -> Option<&mut SyncerHandle> {
        if !self.syncers.contains_key(&height.0) {
            let handle = self.spawn_syncer(height)?;
            self.syncers.insert(height.0, handle);
        }
        self.syncers.get_mut(&height.0)
    }

    fn spawn_syncer(&mut self, height: Height) -> Option<SyncerHandle> {
        let committee =
            Committee::from_chain(self.chain.as_ref(), self.last_rotation, self.committee_size)?;
        let our_index = match committee.index_of(&self.keys.member_id) {
            Some(index) => index,
            None => {
                trace!("not a committee member at {}, no syncer", height);
                return None;
            }
        };

        let mut state = SyncerState::new(height, committee, self.keys.member_id, our_index);
        let best = self.chain.best_snapshot();
        state.set_runnable(height == best.height.next());
        if !state.is_runnable() {
            trace!(
                "syncer {} created while best height is {}, not runnable",
                height,
                best.height
            );
        }
        info!(
            "consensus running block at {}, local designation {}",
            height, our_index
        );

        let (events_tx, events_rx) = mpsc::channel(syncer_queue_capacity(self.committee_size));
        let (quit_tx, quit_rx) = oneshot::channel();
        let syncer = Syncer::new(
            state,
            Arc::clone(&self.chain),
            self.overlay.clone(),
            self.notifications.clone(),
        );
        tokio::spawn(syncer.run(events_rx, quit_rx));

        let mut handle = SyncerHandle {
            events: events_tx,
            quit: Some(quit_tx),
        };
        // Replay messages that arrived before the syncer existed.
        if let Some(stashed) = self.stash.remove(&height.0) {
            for msg in stashed {
                handle.events.try_send(SyncerEvent::Message(msg)).ok();
            }
        }
        Some(handle)
    }

    fn route_consensus_message(&mut self, msg: ConsensusMessage) {
        let height = msg.height();
        if let Some(handle) = self.syncers.get_mut(&height.0) {
            if handle.events.try_send(SyncerEvent::Message(msg)).is_err() {
                warn!("syncer {} event queue overflow", height);
            }
            return;
        }

        // No syncer yet; keep a bounded stash until one is created.
        let limit = syncer_queue_capacity(self.committee_size);
        let stashed = self.stash.entry(height.0).or_default();
        if stashed.len() >= limit {
            stashed.pop_front();
        }
        stashed.push_back(msg);
    }

    fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::MessageReceived(_, Message::Consensus(msg)) => {
                self.route_consensus_message(msg);
            }
            NetworkEvent::MessageReceived(member, Message::GetData(msg)) => {
                self.handle_get_data(member, msg);
            }
            NetworkEvent::MessageReceived(_, Message::Invitation(msg)) => {
                self.handle_invitation(msg);
            }
            NetworkEvent::MessageReceived(_, Message::AckInvitation(msg)) => {
                match self.invitations.handle_ack(&msg) {
                    Ok((member, miner_height)) => {
                        info!("invitation ack from {} at {}", member, miner_height);
                    }
                    Err(err) => info!("refusing invitation ack: {}", err),
                }
            }
            NetworkEvent::MessageReceived(member, Message::Connect(_)) => {
                // Identification is consumed during the handshake; repeats
                // are harmless.
                trace!("ignoring repeated connect from {}", member);
            }
            NetworkEvent::PeerConnected(address, connect) => {
                info!("peer {} connected from {:?}", connect.member, address);
            }
            NetworkEvent::PeerDisconnected(member) => {
                info!("peer {} disconnected", member);
            }
            NetworkEvent::UnableConnectToPeer(member) => {
                info!("unable to connect to member {}", member);
            }
        }
    }

    fn handle_invitation(&mut self, msg: crate::messages::MsgInvitation) {
        match self.invitations.handle_invitation(&msg) {
            InvitationAction::Ignore => {}
            InvitationAction::Rebroadcast => {
                let mut requests = self.network_requests.clone();
                let request = NetworkRequest::Broadcast(Message::Invitation(msg));
                tokio::spawn(async move {
                    use futures::SinkExt;
                    requests.send(request).await.ok();
                });
            }
            InvitationAction::Accept {
                member,
                miner_height,
                address,
                ack,
            } => {
                info!(
                    "accepting invitation from member {} at {}, dialing {}",
                    member, miner_height, address
                );
                let network = self.network.clone();
                tokio::spawn(async move {
                    if network.connect(member, &address).await.is_ok() {
                        network
                            .pool()
                            .send_message(&member, Message::AckInvitation(ack))
                            .await;
                    }
                });
            }
        }
    }
}

impl EventHandler for ConsensusSupervisor {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Chain(event) => self.handle_chain_event(event),
            Event::Network(event) => self.handle_network_event(event),
        }
    }
}
