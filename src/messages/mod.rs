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

//! Wire messages of the committee protocol.
//!
//! Payloads use the chain's binary conventions: little-endian integers,
//! fixed-width identities and hashes, and compact-size prefixed lists. The
//! framing around a payload (length + command) lives in
//! [`crate::events::codec`].

pub use self::types::{
    AckInvitation, Candidate, CandidateResp, Connect, Consensus, GetData, InvitationPayload,
    Knowledge, MsgInvitation, Release, Reply, Signature, BETTER_NOT_MEMBER, BETTER_UNQUALIFIED,
    FLAT_KNOWLEDGE_SENTINEL,
};

mod types;

use anyhow::{bail, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Cursor, Read};

use crate::helpers::{BlockHash, Height, MemberId, BLOCK_HASH_LENGTH, MEMBER_ID_LENGTH};

/// Maximum number of elements accepted in a knowledge list. Bounds memory
/// allocation while decoding untrusted input.
const MAX_LIST_ELEMENTS: u64 = 1024;

/// One of the six consensus message kinds routed to a syncer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusMessage {
    /// Knowledge propagation.
    Knowledge(Knowledge),
    /// Candidacy announcement.
    Candidate(Candidate),
    /// Consent to or rejection of a candidacy.
    CandidateResp(CandidateResp),
    /// Release of consenters by a yielding candidate.
    Release(Release),
    /// Consensus declaration with the candidate's signature.
    Consensus(Consensus),
    /// Contributory signature.
    Signature(Signature),
}

impl ConsensusMessage {
    /// Height the message belongs to.
    pub fn height(&self) -> Height {
        match self {
            Self::Knowledge(msg) => msg.height,
            Self::Candidate(msg) => msg.height,
            Self::CandidateResp(msg) => msg.height,
            Self::Release(msg) => msg.height,
            Self::Consensus(msg) => msg.height,
            Self::Signature(msg) => msg.height,
        }
    }

    /// Member the message came from.
    pub fn author(&self) -> MemberId {
        match self {
            Self::Knowledge(msg) => msg.from,
            Self::Candidate(msg) => msg.from,
            Self::CandidateResp(msg) => msg.from,
            Self::Release(msg) => msg.from,
            Self::Consensus(msg) => msg.from,
            Self::Signature(msg) => msg.from,
        }
    }
}

/// Any message travelling over a committee peer link.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// Consensus traffic for a syncer.
    Consensus(ConsensusMessage),
    /// Block pull request.
    GetData(GetData),
    /// Peer identification.
    Connect(Connect),
    /// Reachability bootstrap envelope.
    Invitation(MsgInvitation),
    /// Reachability bootstrap acknowledgement.
    AckInvitation(AckInvitation),
}

impl Message {
    /// Wire command identifying the message kind.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Consensus(ConsensusMessage::Knowledge(_)) => "knowledge",
            Self::Consensus(ConsensusMessage::Candidate(_)) => "candidate",
            Self::Consensus(ConsensusMessage::CandidateResp(_)) => "candresp",
            Self::Consensus(ConsensusMessage::Release(_)) => "release",
            Self::Consensus(ConsensusMessage::Consensus(_)) => "consensus",
            Self::Consensus(ConsensusMessage::Signature(_)) => "signature",
            Self::GetData(_) => "getdata",
            Self::Connect(_) => "connect",
            Self::Invitation(_) => "invitation",
            Self::AckInvitation(_) => "ackinv",
        }
    }

    /// Serializes the message payload.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96);
        match self {
            Self::Consensus(ConsensusMessage::Knowledge(msg)) => {
                put_member(&mut buf, &msg.finder);
                put_member(&mut buf, &msg.from);
                put_height(&mut buf, msg.height);
                put_hash(&mut buf, &msg.tree_hash);
                put_i64_list(&mut buf, &msg.k);
            }
            Self::Consensus(ConsensusMessage::Candidate(msg)) => {
                put_height(&mut buf, msg.height);
                put_member(&mut buf, &msg.from);
                put_hash(&mut buf, &msg.tree_hash);
                put_var_bytes(&mut buf, &msg.signature);
            }
            Self::Consensus(ConsensusMessage::CandidateResp(msg)) => {
                put_height(&mut buf, msg.height);
                put_member(&mut buf, &msg.from);
                buf.extend_from_slice(msg.reply.tag());
                buf.write_i32::<LittleEndian>(msg.better).unwrap();
                put_hash(&mut buf, &msg.tree_hash);
                put_i64_list(&mut buf, &msg.k);
            }
            Self::Consensus(ConsensusMessage::Release(msg)) => {
                put_height(&mut buf, msg.height);
                put_member(&mut buf, &msg.from);
                buf.write_i32::<LittleEndian>(msg.better).unwrap();
                put_hash(&mut buf, &msg.tree_hash);
                put_i64_list(&mut buf, &msg.k);
            }
            Self::Consensus(ConsensusMessage::Consensus(msg)) => {
                put_height(&mut buf, msg.height);
                put_member(&mut buf, &msg.from);
                put_hash(&mut buf, &msg.tree_hash);
                put_var_bytes(&mut buf, &msg.signature);
            }
            Self::Consensus(ConsensusMessage::Signature(msg)) => {
                put_height(&mut buf, msg.height);
                put_member(&mut buf, &msg.from);
                put_hash(&mut buf, &msg.tree_hash);
                put_var_bytes(&mut buf, &msg.signature);
                put_member(&mut buf, &msg.for_member);
            }
            Self::GetData(msg) => {
                put_height(&mut buf, msg.height);
                put_hash(&mut buf, &msg.tree_hash);
            }
            Self::Connect(msg) => {
                put_member(&mut buf, &msg.member);
                put_var_bytes(&mut buf, msg.host.as_bytes());
                buf.write_i64::<LittleEndian>(msg.time).unwrap();
            }
            Self::Invitation(msg) => {
                put_member(&mut buf, &msg.to);
                buf.write_u32::<LittleEndian>(msg.expire).unwrap();
                put_var_bytes(&mut buf, &msg.sig);
                put_var_bytes(&mut buf, &msg.msg);
            }
            Self::AckInvitation(msg) => {
                put_var_bytes(&mut buf, &msg.sig);
                put_invitation_payload(&mut buf, &msg.invitation);
            }
        }
        buf
    }

    /// Parses a payload according to its wire command.
    pub fn decode_payload(command: &str, payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = Cursor::new(payload);
        let message = match command {
            "knowledge" => Self::Consensus(ConsensusMessage::Knowledge(Knowledge {
                finder: get_member(&mut cur)?,
                from: get_member(&mut cur)?,
                height: get_height(&mut cur)?,
                tree_hash: get_hash(&mut cur)?,
                k: get_i64_list(&mut cur)?,
            })),
            "candidate" => Self::Consensus(ConsensusMessage::Candidate(Candidate {
                height: get_height(&mut cur)?,
                from: get_member(&mut cur)?,
                tree_hash: get_hash(&mut cur)?,
                signature: get_var_bytes(&mut cur)?,
            })),
            "candresp" => {
                let height = get_height(&mut cur)?;
                let from = get_member(&mut cur)?;
                let mut tag = [0; 4];
                cur.read_exact(&mut tag)?;
                let reply = match Reply::from_tag(&tag) {
                    Some(reply) => reply,
                    None => bail!("unknown candidate response tag {:?}", tag),
                };
                Self::Consensus(ConsensusMessage::CandidateResp(CandidateResp {
                    height,
                    from,
                    reply,
                    better: cur.read_i32::<LittleEndian>()?,
                    tree_hash: get_hash(&mut cur)?,
                    k: get_i64_list(&mut cur)?,
                }))
            }
            "release" => Self::Consensus(ConsensusMessage::Release(Release {
                height: get_height(&mut cur)?,
                from: get_member(&mut cur)?,
                better: cur.read_i32::<LittleEndian>()?,
                tree_hash: get_hash(&mut cur)?,
                k: get_i64_list(&mut cur)?,
            })),
            "consensus" => Self::Consensus(ConsensusMessage::Consensus(Consensus {
                height: get_height(&mut cur)?,
                from: get_member(&mut cur)?,
                tree_hash: get_hash(&mut cur)?,
                signature: get_var_bytes(&mut cur)?,
            })),
            "signature" => Self::Consensus(ConsensusMessage::Signature(Signature {
                height: get_height(&mut cur)?,
                from: get_member(&mut cur)?,
                tree_hash: get_hash(&mut cur)?,
                signature: get_var_bytes(&mut cur)?,
                for_member: get_member(&mut cur)?,
            })),
            "getdata" => Self::GetData(GetData {
                height: get_height(&mut cur)?,
                tree_hash: get_hash(&mut cur)?,
            }),
            "connect" => Self::Connect(Connect {
                member: get_member(&mut cur)?,
                host: String::from_utf8(get_var_bytes(&mut cur)?)?,
                time: cur.read_i64::<LittleEndian>()?,
            }),
            "invitation" => Self::Invitation(MsgInvitation {
                to: get_member(&mut cur)?,
                expire: cur.read_u32::<LittleEndian>()?,
                sig: get_var_bytes(&mut cur)?,
                msg: get_var_bytes(&mut cur)?,
            }),
            "ackinv" => Self::AckInvitation(AckInvitation {
                sig: get_var_bytes(&mut cur)?,
                invitation: get_invitation_payload(&mut cur)?,
            }),
            other => bail!("unknown wire command {:?}", other),
        };

        ensure!(
            cur.position() == payload.len() as u64,
            "trailing bytes after {} payload",
            command
        );
        Ok(message)
    }
}

impl From<ConsensusMessage> for Message {
    fn from(msg: ConsensusMessage) -> Self {
        Self::Consensus(msg)
    }
}

/// Serializes an invitation payload. Also used standalone: the invitation
/// signature commits to exactly these bytes.
pub fn put_invitation_payload(buf: &mut Vec<u8>, payload: &InvitationPayload) {
    buf.write_u32::<LittleEndian>(payload.height).unwrap();
    buf.extend_from_slice(&payload.pubkey);
    put_var_bytes(buf, &payload.ip);
}

/// Parses an invitation payload.
pub fn get_invitation_payload(cur: &mut Cursor<&[u8]>) -> anyhow::Result<InvitationPayload> {
    let height = cur.read_u32::<LittleEndian>()?;
    let mut pubkey = [0; 33];
    cur.read_exact(&mut pubkey)?;
    Ok(InvitationPayload {
        height,
        pubkey,
        ip: get_var_bytes(cur)?,
    })
}

fn put_height(buf: &mut Vec<u8>, height: Height) {
    buf.write_i32::<LittleEndian>(height.0).unwrap();
}

fn get_height(cur: &mut Cursor<&[u8]>) -> anyhow::Result<Height> {
    Ok(Height(cur.read_i32::<LittleEndian>()?))
}

fn put_member(buf: &mut Vec<u8>, member: &MemberId) {
    buf.extend_from_slice(member.as_bytes());
}

fn get_member(cur: &mut Cursor<&[u8]>) -> anyhow::Result<MemberId> {
    let mut bytes = [0; MEMBER_ID_LENGTH];
    cur.read_exact(&mut bytes)?;
    Ok(MemberId(bytes))
}

fn put_hash(buf: &mut Vec<u8>, hash: &BlockHash) {
    buf.extend_from_slice(hash.as_bytes());
}

fn get_hash(cur: &mut Cursor<&[u8]>) -> anyhow::Result<BlockHash> {
    let mut bytes = [0; BLOCK_HASH_LENGTH];
    cur.read_exact(&mut bytes)?;
    Ok(BlockHash(bytes))
}

/// Writes a compact-size integer (1, 3, 5 or 9 bytes depending on range).
fn put_var_int(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfd);
        buf.write_u16::<LittleEndian>(value as u16).unwrap();
    } else if value <= 0xffff_ffff {
        buf.push(0xfe);
        buf.write_u32::<LittleEndian>(value as u32).unwrap();
    } else {
        buf.push(0xff);
        buf.write_u64::<LittleEndian>(value).unwrap();
    }
}

fn get_var_int(cur: &mut Cursor<&[u8]>) -> anyhow::Result<u64> {
    let discriminant = cur.read_u8()?;
    let value = match discriminant {
        0xfd => {
            let value = u64::from(cur.read_u16::<LittleEndian>()?);
            ensure!(value >= 0xfd, "non-canonical compact size");
            value
        }
        0xfe => {
            let value = u64::from(cur.read_u32::<LittleEndian>()?);
            ensure!(value > 0xffff, "non-canonical compact size");
            value
        }
        0xff => {
            let value = cur.read_u64::<LittleEndian>()?;
            ensure!(value > 0xffff_ffff, "non-canonical compact size");
            value
        }
        small => u64::from(small),
    };
    Ok(value)
}

fn put_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_var_int(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn get_var_bytes(cur: &mut Cursor<&[u8]>) -> anyhow::Result<Vec<u8>> {
    let len = get_var_int(cur)?;
    ensure!(
        len <= cur.get_ref().len() as u64,
        "byte list length {} exceeds payload",
        len
    );
    let mut bytes = vec![0; len as usize];
    cur.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn put_i64_list(buf: &mut Vec<u8>, list: &[i64]) {
    put_var_int(buf, list.len() as u64);
    for &value in list {
        buf.write_i64::<LittleEndian>(value).unwrap();
    }
}

fn get_i64_list(cur: &mut Cursor<&[u8]>) -> anyhow::Result<Vec<i64>> {
    let len = get_var_int(cur)?;
    ensure!(len <= MAX_LIST_ELEMENTS, "knowledge list too long: {}", len);
    let mut list = Vec::with_capacity(len as usize);
    for _ in 0..len {
        list.push(cur.read_i64::<LittleEndian>()?);
    }
    Ok(list)
}
