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

use crate::helpers::{BlockHash, Height, MemberId};

/// First path element marking a flat-matrix encoding: the remainder of the
/// list is a knowledge row vector instead of a propagation path.
pub const FLAT_KNOWLEDGE_SENTINEL: i64 = -1024;

/// `better` value of a rejection caused by the sender not being a committee
/// member.
pub const BETTER_NOT_MEMBER: i32 = -1;

/// `better` value of a rejection caused by the candidate tree not being
/// qualified yet.
pub const BETTER_UNQUALIFIED: i32 = -2;

/// Knowledge propagation about one candidate tree.
///
/// ### Validation
///
/// The message is discarded if `finder` is not a committee member, is marked
/// malicious, or announces a hash conflicting with the registered tree of
/// the same creator.
///
/// ### Processing
///
/// The knowledge matrix of the finder's tree absorbs the propagation path;
/// a gain may trigger the candidacy procedure. An unknown tree is installed
/// as a hash-only placeholder and pulled from the sender.
///
/// ### Generation
///
/// Synthesized with path `[self]` when a node's own candidate block arrives;
/// extended by one hop and relayed by the repeater and the
/// duplicate-knowledge procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Knowledge {
    /// Creator of the tree this knowledge is about.
    pub finder: MemberId,
    /// Member that handed the message to us.
    pub from: MemberId,
    /// Consensus height.
    pub height: Height,
    /// Hash of the finder's candidate tree.
    pub tree_hash: BlockHash,
    /// Propagation path as member indices, or a flat row vector introduced
    /// by [`FLAT_KNOWLEDGE_SENTINEL`].
    pub k: Vec<i64>,
}

impl Knowledge {
    /// Creates a knowledge message with a propagation path.
    pub fn with_path(
        finder: MemberId,
        from: MemberId,
        height: Height,
        tree_hash: BlockHash,
        path: Vec<i64>,
    ) -> Self {
        debug_assert!(path.first() != Some(&FLAT_KNOWLEDGE_SENTINEL));
        Self {
            finder,
            from,
            height,
            tree_hash,
            k: path,
        }
    }

    /// Creates a flat-matrix knowledge message carrying a whole row vector.
    pub fn flat(
        finder: MemberId,
        from: MemberId,
        height: Height,
        tree_hash: BlockHash,
        rows: &[u64],
    ) -> Self {
        let mut k = Vec::with_capacity(rows.len() + 1);
        k.push(FLAT_KNOWLEDGE_SENTINEL);
        k.extend(rows.iter().map(|&row| row as i64));
        Self {
            finder,
            from,
            height,
            tree_hash,
            k,
        }
    }

    /// Whether the message carries a flat row vector.
    pub fn is_flat(&self) -> bool {
        self.k.first() == Some(&FLAT_KNOWLEDGE_SENTINEL)
    }

    /// The row vector of a flat message.
    pub fn flat_rows(&self) -> Option<Vec<u64>> {
        if self.is_flat() {
            Some(self.k[1..].iter().map(|&row| row as u64).collect())
        } else {
            None
        }
    }

    /// The propagation path of a non-flat message.
    pub fn path(&self) -> &[i64] {
        if self.is_flat() {
            &[]
        } else {
            &self.k
        }
    }

    /// Returns a copy of this message extended by one hop: `relay` becomes
    /// the new sender and is appended to the path.
    pub fn extended(&self, relay: MemberId, relay_index: usize) -> Self {
        let mut extended = self.clone();
        extended.from = relay;
        extended.k.push(relay_index as i64);
        extended
    }
}

/// Candidacy announcement.
///
/// ### Processing
///
/// The receiver records the sender in its `asked` set and replies with a
/// [`CandidateResp`], consenting when the sender's tree is qualified and no
/// better commitment exists.
///
/// ### Generation
///
/// Broadcast by a member whose own tree became qualified while it is free
/// or already its own candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Consensus height.
    pub height: Height,
    /// Announcing member.
    pub from: MemberId,
    /// Hash of the announcer's candidate tree.
    pub tree_hash: BlockHash,
    /// `pubkey ‖ DER` signature over the canonical sig-hash.
    pub signature: Vec<u8>,
}

/// Reply tag of a [`CandidateResp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The sender consents to the candidacy.
    Consent,
    /// The sender rejects the candidacy; `better` names the reason.
    Reject,
}

impl Reply {
    /// Four-character wire tag.
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            Self::Consent => b"cnst",
            Self::Reject => b"rjct",
        }
    }

    /// Parses a wire tag.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"cnst" => Some(Self::Consent),
            b"rjct" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Response to a candidacy announcement.
///
/// ### Processing
///
/// A consent is counted toward the candidate's quorum. A rejection carries
/// the rejecting member's preference in `better`: [`BETTER_NOT_MEMBER`],
/// [`BETTER_UNQUALIFIED`], or the index of the tree it has agreed to.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateResp {
    /// Consensus height.
    pub height: Height,
    /// Responding member.
    pub from: MemberId,
    /// Consent or rejection.
    pub reply: Reply,
    /// Rejection reason or preferred tree index.
    pub better: i32,
    /// Hash of the tree the response refers to.
    pub tree_hash: BlockHash,
    /// Optional knowledge payload accompanying the response.
    pub k: Vec<i64>,
}

/// Notification that an agreed candidate has yielded to a better one.
///
/// ### Processing
///
/// The receiver drops the sender from `asked`; if it had agreed to the
/// sender, it absorbs the attached flat knowledge about the better tree,
/// pulls the tree if unknown, and becomes free again.
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    /// Consensus height.
    pub height: Height,
    /// The yielding member.
    pub from: MemberId,
    /// Index of the better tree.
    pub better: i32,
    /// Hash of the better tree.
    pub tree_hash: BlockHash,
    /// Flat knowledge rows about the better tree.
    pub k: Vec<i64>,
}

/// Declaration that the sender collected a consent majority and signed its
/// own tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    /// Consensus height.
    pub height: Height,
    /// The candidate declaring consensus.
    pub from: MemberId,
    /// Hash of the finalizing tree.
    pub tree_hash: BlockHash,
    /// `pubkey ‖ DER` signature over the canonical sig-hash.
    pub signature: Vec<u8>,
}

/// A member's contributory signature on the chosen block.
///
/// Embeds the fields of [`Consensus`] plus the owner of the signed tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Consensus height.
    pub height: Height,
    /// The signing member.
    pub from: MemberId,
    /// Hash of the signed tree.
    pub tree_hash: BlockHash,
    /// `pubkey ‖ DER` signature over the canonical sig-hash.
    pub signature: Vec<u8>,
    /// Creator of the signed tree.
    pub for_member: MemberId,
}

/// Out-of-band request for a candidate block by hash.
///
/// ### Generation
///
/// Sent to the tree creator (or whoever referenced the hash) when a message
/// names a tree this node has never seen. The block itself travels back
/// through the block subsystem, re-entering consensus as a new tree.
#[derive(Debug, Clone, PartialEq)]
pub struct GetData {
    /// Consensus height.
    pub height: Height,
    /// Hash of the requested tree.
    pub tree_hash: BlockHash,
}

/// Identification message opening every committee peer link.
///
/// ### Processing
///
/// The connection is registered in the peer pool under the advertised miner
/// identity, which lets the overlay route member messages over inbound
/// connections as well.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    /// Miner identity of the connecting node.
    pub member: MemberId,
    /// Public address of the connecting node.
    pub host: String,
    /// Unix timestamp of message creation.
    pub time: i64,
}

/// Plaintext payload of an invitation, RSA-encrypted in transit.
#[derive(Debug, Clone, PartialEq)]
pub struct InvitationPayload {
    /// Miner height of the inviting member.
    pub height: u32,
    /// Compressed secp256k1 public key of the inviter.
    pub pubkey: [u8; 33],
    /// External address of the inviter as UTF-8 `host:port`.
    pub ip: Vec<u8>,
}

/// Broadcast envelope asking an unreachable member to dial back.
///
/// ### Validation
///
/// Expired envelopes (`expire` below the current rotation) are dropped.
/// A node that fails to decrypt the payload relays the envelope with
/// deduplication; the addressee validates the inner signature against the
/// miner block at the stated height before dialing.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgInvitation {
    /// Addressee miner identity.
    pub to: MemberId,
    /// Rotation index after which the envelope is dead.
    pub expire: u32,
    /// Inviter's signature over the double-SHA256 of the serialized payload.
    pub sig: Vec<u8>,
    /// RSA-OAEP ciphertext of the serialized [`InvitationPayload`].
    pub msg: Vec<u8>,
}

/// Signed acknowledgement completing an invitation handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct AckInvitation {
    /// Responder's signature over the double-SHA256 of its own payload.
    pub sig: Vec<u8>,
    /// The responder's own invitation payload, in the clear.
    pub invitation: InvitationPayload,
}
