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

//! Committee consensus engine of the Arbor blockchain node.
//!
//! # Overview
//!
//! Arbor finalizes proof-of-work blocks through a rotating committee: the
//! miners of the `n` most recent miner-chain blocks. Each member mines a
//! candidate block per height; the committee exchanges knowledge about the
//! candidates, converges on one, and collects a signature majority that
//! finalizes it. This crate contains:
//!
//! - [`ConsensusNode`]: the runnable bundle of the supervisor, the committee
//!   overlay and the peer network;
//! - configuration types rooted in [`NodeConfig`];
//! - the [`chain`] module defining the interface to the chain subsystem.
//!
//! The chain subsystem (block validation, miner chain, storage) is an
//! external collaborator: the embedding node implements
//! [`chain::ChainView`], feeds [`chain::ChainEvent`]s in, and consumes
//! [`NodeNotification`]s coming out.

#![warn(
    missing_debug_implementations,
    unsafe_code,
    bare_trait_objects
)]

pub use crate::{
    helpers::{BlockHash, Height, MemberId},
    overlay::{CommitteeOverlay, SendError},
};

use anyhow::ensure;
use futures::{channel::mpsc, future, FutureExt};
use rsa::RsaPrivateKey;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde_derive::{Deserialize, Serialize};

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    chain::{ChainEvent, ChainView},
    events::{HandlerPart, NetworkHandler, NetworkPart, SharedConnectionPool},
    invitation::Invitations,
    messages::Connect,
    supervisor::ConsensusSupervisor,
};

pub mod chain;
pub mod crypto;
pub mod helpers;
pub mod knowledge;
pub mod messages;
pub mod state;

mod consensus;
mod events;
mod invitation;
mod overlay;
mod requests;
#[cfg(test)]
mod sandbox;
mod supervisor;

/// Shorthand for milliseconds-valued configuration fields.
pub type Milliseconds = u64;

/// Notifications emitted by the consensus subsystem for the embedding node.
#[derive(Debug, Clone)]
pub enum NodeNotification {
    /// A finalized block was rejected by the chain. The height is retried
    /// only when the chain publishes a new snapshot.
    BlockRejected {
        /// Height of the rejected block.
        height: Height,
        /// Hash of the rejected block.
        hash: BlockHash,
    },
    /// A committee peer asked for a block by hash; the block relay should
    /// serve it.
    DataRequested {
        /// The requesting member.
        member: MemberId,
        /// Height of the requested tree.
        height: Height,
        /// Hash of the requested block.
        hash: BlockHash,
    },
}

/// Committee protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommitteeConfig {
    /// Number of committee members, `n`. A quorum is `⌊n/2⌋ + 1`
    /// signatures.
    pub committee_size: u32,
    /// Maximum wire message length in bytes.
    pub max_message_len: u32,
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        Self {
            committee_size: 5,
            max_message_len: 1024 * 1024,
        }
    }
}

/// P2P network configuration of the committee overlay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    /// Maximum number of incoming connections established with peers at any
    /// given time.
    pub max_incoming_connections: usize,
    /// Maximum number of outgoing connections established with peers at any
    /// given time.
    pub max_outgoing_connections: usize,
    /// Switches on the `TCP_NODELAY` option.
    pub tcp_nodelay: bool,
    /// Interval between keep-alive TCP probes; `None` disables probing.
    pub tcp_keep_alive: Option<Milliseconds>,
    /// Base retry interval for outbound connections and unsent overlay
    /// messages. Grows by a factor on each consecutive failure.
    pub tcp_connect_retry_timeout: Milliseconds,
    /// Maximum number of retries when connecting to a peer.
    pub tcp_connect_max_retries: u64,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            max_incoming_connections: 128,
            max_outgoing_connections: 128,
            tcp_keep_alive: None,
            tcp_nodelay: true,
            tcp_connect_retry_timeout: 5_000,
            tcp_connect_max_retries: 10,
        }
    }
}

/// Events pool capacities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventsPoolCapacity {
    /// Maximum number of queued outgoing network requests.
    pub network_requests_capacity: usize,
    /// Maximum number of queued incoming network messages.
    pub network_events_capacity: usize,
    /// Maximum number of queued chain notifications.
    pub chain_events_capacity: usize,
    /// Maximum number of queued outbound node notifications.
    pub notifications_capacity: usize,
}

impl Default for EventsPoolCapacity {
    fn default() -> Self {
        Self {
            network_requests_capacity: 512,
            network_events_capacity: 512,
            chain_events_capacity: 128,
            notifications_capacity: 128,
        }
    }
}

/// Configuration of a consensus node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Committee protocol parameters.
    pub committee: CommitteeConfig,
    /// Network listening address.
    pub listen_address: SocketAddr,
    /// Public address other members dial and invitations advertise.
    pub external_address: String,
    /// P2P network configuration.
    pub network: NetworkConfiguration,
    /// Event channel capacities.
    pub events_pool: EventsPoolCapacity,
}

impl NodeConfig {
    /// Checks the configuration for consistency.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.committee.committee_size >= 2,
            "committee_size({}) must be at least 2",
            self.committee.committee_size
        );
        ensure!(
            self.committee.committee_size <= 64,
            "committee_size({}) must fit a 64-bit knowledge mask",
            self.committee.committee_size
        );
        ensure!(
            self.committee.max_message_len > 0,
            "max_message_len must be strictly larger than 0"
        );
        ensure!(
            self.events_pool.network_events_capacity > 0
                && self.events_pool.network_requests_capacity > 0
                && self.events_pool.chain_events_capacity > 0,
            "event channel capacities must be strictly larger than 0"
        );
        ensure!(
            self.network.tcp_connect_retry_timeout > 0,
            "tcp_connect_retry_timeout must be strictly larger than 0"
        );
        Ok(())
    }
}

/// Signing material of a local committee member.
#[derive(Clone)]
pub struct Keys {
    /// The member identity derived from the public key.
    pub member_id: MemberId,
    /// secp256k1 signing key for consensus messages.
    pub secret_key: SecretKey,
    /// RSA key for decrypting invitations, when this member publishes RSA
    /// reachability.
    pub rsa_key: Option<RsaPrivateKey>,
}

impl Keys {
    /// Derives the member identity from the signing key.
    pub fn new(secret_key: SecretKey, rsa_key: Option<RsaPrivateKey>) -> Self {
        let secp = Secp256k1::new();
        let member_id =
            crypto::member_id_for_pubkey(&PublicKey::from_secret_key(&secp, &secret_key));
        Self {
            member_id,
            secret_key,
            rsa_key,
        }
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Keys")
            .field("member_id", &self.member_id)
            .field("rsa", &self.rsa_key.is_some())
            .finish()
    }
}

/// Channels between the consensus node and its environment.
#[derive(Debug)]
struct NodeChannel {
    chain_events: (mpsc::Sender<ChainEvent>, mpsc::Receiver<ChainEvent>),
    network_events: (
        mpsc::Sender<events::NetworkEvent>,
        mpsc::Receiver<events::NetworkEvent>,
    ),
    network_requests: (
        mpsc::Sender<events::NetworkRequest>,
        mpsc::Receiver<events::NetworkRequest>,
    ),
    notifications: (
        mpsc::Sender<NodeNotification>,
        mpsc::Receiver<NodeNotification>,
    ),
}

impl NodeChannel {
    fn new(capacity: &EventsPoolCapacity) -> Self {
        Self {
            chain_events: mpsc::channel(capacity.chain_events_capacity),
            network_events: mpsc::channel(capacity.network_events_capacity),
            network_requests: mpsc::channel(capacity.network_requests_capacity),
            notifications: mpsc::channel(capacity.notifications_capacity),
        }
    }
}

/// Handle for feeding chain events into a running node.
pub type ChainSender = mpsc::Sender<ChainEvent>;

/// Stream of notifications emitted by a running node.
pub type Notifications = mpsc::Receiver<NodeNotification>;

/// The consensus subsystem, assembled and ready to run.
pub struct ConsensusNode {
    handler_part: HandlerPart<ConsensusSupervisor>,
    network_part: NetworkPart,
    chain_sender: ChainSender,
    notifications: Option<Notifications>,
}

impl std::fmt::Debug for ConsensusNode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ConsensusNode").finish()
    }
}

impl ConsensusNode {
    /// Assembles a node over the given chain view.
    pub fn new(
        config: NodeConfig,
        chain: Arc<dyn ChainView>,
        keys: Keys,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let channel = NodeChannel::new(&config.events_pool);

        let our_connect = Connect {
            member: keys.member_id,
            host: config.external_address.clone(),
            time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or(0),
        };
        let pool = SharedConnectionPool::new(keys.member_id);
        let network = NetworkHandler::new(
            config.listen_address,
            pool,
            config.network,
            channel.network_events.0.clone(),
            our_connect,
            config.committee.max_message_len,
        );

        let invitations = Arc::new(Invitations::new(
            Arc::clone(&chain),
            keys.clone(),
            config.external_address.clone(),
            config.committee.committee_size,
        ));
        let overlay = CommitteeOverlay::new(
            network.clone(),
            channel.network_requests.0.clone(),
            Arc::clone(&invitations),
            Arc::clone(&chain),
            keys.member_id,
            config.committee.committee_size,
            Duration::from_millis(config.network.tcp_connect_retry_timeout),
        );

        let mut supervisor = ConsensusSupervisor::new(
            chain,
            overlay,
            invitations,
            network.clone(),
            channel.network_requests.0.clone(),
            channel.notifications.0,
            keys,
            config.committee.committee_size,
        );
        supervisor.initialize();

        Ok(Self {
            handler_part: HandlerPart {
                handler: supervisor,
                chain_rx: channel.chain_events.1,
                network_rx: channel.network_events.1,
            },
            network_part: NetworkPart {
                handler: network,
                network_requests: channel.network_requests.1,
            },
            chain_sender: channel.chain_events.0,
            notifications: Some(channel.notifications.1),
        })
    }

    /// Sender for chain subsystem events. Clone freely.
    pub fn chain_sender(&self) -> ChainSender {
        self.chain_sender.clone()
    }

    /// Takes the notification stream. Available once.
    pub fn notifications(&mut self) -> Option<Notifications> {
        self.notifications.take()
    }

    /// Runs the node until the chain event channel closes.
    pub async fn run(self) {
        let handler_task = self.handler_part.run().fuse();
        futures::pin_mut!(handler_task);
        let network_task = self.network_part.run().fuse();
        futures::pin_mut!(network_task);

        future::select(handler_task, network_task).await;
        log::info!("Node terminated");
    }
}
