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

//! Committee overlay: one logical outbound channel per committee member.
//!
//! The overlay maintains a bounded queue and a delivery task for every
//! member of the current committee window. Sending never blocks the caller
//! on network I/O; the delivery task reuses an existing peer link where one
//! exists, dials the member's published endpoint otherwise, and falls back
//! to the invitation protocol when the member publishes an RSA key instead
//! of an address. Messages stay FIFO per member, and a message that could
//! not be sent is retried with a growing back-off rather than dropped.

use futures::{channel::mpsc, SinkExt, StreamExt};
use thiserror::Error;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    chain::ChainView,
    events::{error::LogError, NetworkHandler, NetworkRequest},
    helpers::MemberId,
    invitation::Invitations,
    messages::Message,
};

/// Capacity of a member's outbound queue.
const MEMBER_QUEUE_CAPACITY: usize = 50;

/// Reachability payloads shorter than this are `host:port` endpoints; a
/// 1024-bit RSA public key cannot be encoded in fewer bytes.
pub const ENDPOINT_MAX_LENGTH: usize = 128;

/// Errors surfaced to overlay callers. Delivery failures past the queue are
/// handled inside the delivery task and never reach the syncer.
#[derive(Debug, Error, PartialEq)]
pub enum SendError {
    /// The target is not in the current committee window.
    #[error("member {0} is not in the committee")]
    NotInCommittee(MemberId),
    /// The member's outbound queue is full; the message was not enqueued.
    #[error("outbound queue for member {0} is full")]
    QueueFull(MemberId),
}

#[derive(Debug)]
struct MemberEntry {
    miner_height: u32,
    queue: mpsc::Sender<Message>,
}

#[derive(Debug, Default)]
struct OverlayState {
    members: HashMap<MemberId, MemberEntry>,
}

struct Shared {
    handler: NetworkHandler,
    network_requests: mpsc::Sender<NetworkRequest>,
    invitations: Arc<Invitations>,
    chain: Arc<dyn ChainView>,
    our_id: MemberId,
    committee_size: u32,
    retry_timeout: Duration,
}

/// Handle to the overlay; cheap to clone.
#[derive(Clone)]
pub struct CommitteeOverlay {
    state: Arc<Mutex<OverlayState>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CommitteeOverlay {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CommitteeOverlay")
            .field("state", &self.state)
            .finish()
    }
}

impl CommitteeOverlay {
    pub fn new(
        handler: NetworkHandler,
        network_requests: mpsc::Sender<NetworkRequest>,
        invitations: Arc<Invitations>,
        chain: Arc<dyn ChainView>,
        our_id: MemberId,
        committee_size: u32,
        retry_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(OverlayState::default())),
            shared: Arc::new(Shared {
                handler,
                network_requests,
                invitations,
                chain,
                our_id,
                committee_size,
                retry_timeout,
            }),
        }
    }

    /// Enqueues a message for one committee member.
    pub fn send(&self, member: &MemberId, message: Message) -> Result<(), SendError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .members
            .get_mut(member)
            .ok_or(SendError::NotInCommittee(*member))?;
        entry
            .queue
            .try_send(message)
            .map_err(|_| SendError::QueueFull(*member))
    }

    /// Enqueues a message for every member except `exclude` (and ourselves).
    /// Per-member failures are logged; broadcast ordering across targets is
    /// not guaranteed.
    pub fn broadcast(&self, message: &Message, exclude: Option<&MemberId>) {
        let mut state = self.state.lock().unwrap();
        for (member, entry) in &mut state.members {
            if Some(member) == exclude {
                continue;
            }
            if entry.queue.try_send(message.clone()).is_err() {
                log::warn!(
                    "outbound queue for member {} is full, {} message stalled",
                    member,
                    message.command()
                );
            }
        }
    }

    /// Advances the member window to `new_last_rotation`: drops members that
    /// rotated out, adds every miner of the new window. Calling twice with
    /// the same rotation is a no-op.
    pub fn rotate(&self, new_last_rotation: u32) {
        let n = self.shared.committee_size;
        let cutoff = new_last_rotation.saturating_sub(n);

        let mut state = self.state.lock().unwrap();
        state.members.retain(|member, entry| {
            let keep = entry.miner_height >= cutoff;
            if !keep {
                log::info!("member {} rotated out of the committee", member);
            }
            keep
        });

        let bottom = new_last_rotation.saturating_sub(n - 1);
        for miner_height in bottom..=new_last_rotation {
            let block = match self.shared.chain.miner_block_by_height(miner_height) {
                Some(block) => block,
                None => continue,
            };
            if block.miner == self.shared.our_id || state.members.contains_key(&block.miner) {
                continue;
            }

            let (queue, queue_rx) = mpsc::channel(MEMBER_QUEUE_CAPACITY);
            state.members.insert(
                block.miner,
                MemberEntry {
                    miner_height,
                    queue,
                },
            );
            tokio::spawn(delivery_loop(
                block.miner,
                miner_height,
                queue_rx,
                self.state.clone(),
                self.shared.clone(),
            ));
        }
    }

    /// Closes the member's queue; pending messages are dropped.
    pub fn disconnect(&self, member: &MemberId) {
        let removed = self.state.lock().unwrap().members.remove(member).is_some();
        if removed {
            let mut requests = self.shared.network_requests.clone();
            let request = NetworkRequest::DisconnectWithPeer(*member);
            tokio::spawn(async move {
                requests.send(request).await.ok();
            });
        }
    }

    /// Whether the member currently has an overlay entry.
    pub fn is_member(&self, member: &MemberId) -> bool {
        self.state.lock().unwrap().members.contains_key(member)
    }

    /// Current member entries as (identity, miner height) pairs.
    pub fn members(&self) -> Vec<(MemberId, u32)> {
        self.state
            .lock()
            .unwrap()
            .members
            .iter()
            .map(|(member, entry)| (*member, entry.miner_height))
            .collect()
    }

    /// Registers a member entry with an externally supplied queue and no
    /// delivery task. Lets tests capture overlay traffic.
    #[cfg(test)]
    pub(crate) fn insert_member_for_tests(
        &self,
        member: MemberId,
        miner_height: u32,
        queue: mpsc::Sender<Message>,
    ) {
        self.state.lock().unwrap().members.insert(
            member,
            MemberEntry {
                miner_height,
                queue,
            },
        );
    }
}

/// Delivery task of one member entry. Exits when the entry is removed from
/// the overlay (its queue sender is dropped).
async fn delivery_loop(
    member: MemberId,
    miner_height: u32,
    mut queue_rx: mpsc::Receiver<Message>,
    state: Arc<Mutex<OverlayState>>,
    shared: Arc<Shared>,
) {
    let mut unsent: Option<Message> = None;
    let mut wfactor = 1_u32;

    loop {
        // The buffered unsent message keeps its place at the head of the
        // line; newer messages stall behind it.
        let message = match unsent.take() {
            Some(message) => message,
            None => match queue_rx.next().await {
                Some(message) => message,
                None => break,
            },
        };

        // Drop pending traffic once the member has rotated out.
        if !state.lock().unwrap().members.contains_key(&member) {
            break;
        }

        if shared.handler.pool().send_message(&member, message.clone()).await {
            wfactor = 1;
            continue;
        }

        // No live peer advertises this identity; fall back to the published
        // reachability of the member's miner block.
        let connection = shared
            .chain
            .miner_block_by_height(miner_height)
            .map(|block| block.connection)
            .unwrap_or_default();

        if !connection.is_empty() && connection.len() < ENDPOINT_MAX_LENGTH {
            match std::str::from_utf8(&connection) {
                Ok(address) => {
                    if shared.handler.connect(member, address).await.is_ok()
                        && shared.handler.pool().send_message(&member, message.clone()).await
                    {
                        wfactor = 1;
                        continue;
                    }
                }
                Err(_) => {
                    log::warn!("member {} published a malformed endpoint", member);
                }
            }
        } else if !connection.is_empty() {
            // RSA reachability: we cannot dial; ask the member to dial us.
            match shared.invitations.make_invitation_msg(&member, &connection) {
                Ok(envelope) => {
                    let mut requests = shared.network_requests.clone();
                    requests
                        .send(NetworkRequest::Broadcast(Message::Invitation(envelope)))
                        .await
                        .log_error();
                }
                Err(err) => {
                    log::info!("cannot invite member {}: {}", member, err);
                }
            }
        }

        unsent = Some(message);
        tokio::time::sleep(shared.retry_timeout * wfactor).await;
        wfactor += 1;
    }

    log::trace!("delivery loop for member {} finished", member);
}
