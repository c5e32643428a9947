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

//! Reachability bootstrap for members without a dialable endpoint.
//!
//! When a miner block publishes an RSA public key instead of a `host:port`,
//! the member cannot be dialed directly. Instead an [`MsgInvitation`] is
//! flooded through the peer network: only the addressee can decrypt it,
//! everyone else relays it with deduplication. The addressee validates the
//! inviter against the miner chain, dials the address inside, and answers
//! with a signed [`AckInvitation`].

use anyhow::{ensure, format_err};
use rand::Rng;
use secp256k1::{ecdsa, All, Message as SecpMessage, PublicKey, Secp256k1};

use std::{
    collections::HashMap,
    io::Cursor,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    chain::ChainView,
    crypto,
    helpers::MemberId,
    messages::{self, AckInvitation, InvitationPayload, MsgInvitation},
    Keys,
};

use std::sync::Arc;

/// How long a relayed invitation stays in the dedup inventory, in seconds.
const INVENTORY_EXPIRY_SECS: u64 = 300;

/// Outcome of processing an inbound invitation envelope.
#[derive(Debug)]
pub enum InvitationAction {
    /// Expired, malformed, or already seen; drop it.
    Ignore,
    /// Not addressed to us and not seen before; relay to the peer network.
    Rebroadcast,
    /// Addressed to us and valid: dial the inviter and answer with the ack.
    Accept {
        /// Identity of the inviting member.
        member: MemberId,
        /// Miner height of the inviting member.
        miner_height: u32,
        /// Endpoint the inviter asked us to dial.
        address: String,
        /// Our signed acknowledgement.
        ack: AckInvitation,
    },
}

/// Invitation construction and validation.
pub struct Invitations {
    chain: Arc<dyn ChainView>,
    keys: Keys,
    secp: Secp256k1<All>,
    external_address: String,
    committee_size: u32,
    // Inventory of relayed envelopes: payload hash -> expiry unix time.
    broadcasted: Mutex<HashMap<[u8; 32], u64>>,
}

impl Invitations {
    pub fn new(
        chain: Arc<dyn ChainView>,
        keys: Keys,
        external_address: String,
        committee_size: u32,
    ) -> Self {
        Self {
            chain,
            keys,
            secp: Secp256k1::new(),
            external_address,
            committee_size,
            broadcasted: Mutex::new(HashMap::new()),
        }
    }

    /// Scans the committee window around rotation `r` for a miner block
    /// produced by this node, returning its miner height.
    pub fn my_place_in_committee(&self, r: u32) -> Option<u32> {
        let n = self.committee_size;
        let bottom = r.saturating_sub(n - 1);
        for height in bottom..r + n {
            let block = match self.chain.miner_block_by_height(height) {
                Some(block) => block,
                None => continue,
            };
            if block.miner == self.keys.member_id {
                return Some(height);
            }
        }
        None
    }

    /// Builds an invitation envelope for a member whose `connection` payload
    /// is an RSA public key.
    pub fn make_invitation_msg(
        &self,
        target: &MemberId,
        connection: &[u8],
    ) -> anyhow::Result<MsgInvitation> {
        ensure!(
            !self.external_address.is_empty(),
            "cannot invite without an external address"
        );
        let last_rotation = self.chain.best_snapshot().last_rotation;
        let me = self
            .my_place_in_committee(last_rotation)
            .ok_or_else(|| format_err!("this node is not in the committee window"))?;

        let payload = InvitationPayload {
            height: me,
            pubkey: PublicKey::from_secret_key(&self.secp, &self.keys.secret_key).serialize(),
            ip: self.external_address.as_bytes().to_vec(),
        };
        let mut serialized = Vec::with_capacity(64);
        messages::put_invitation_payload(&mut serialized, &payload);

        let digest = crypto::double_sha256(&serialized);
        let signature = self
            .secp
            .sign_ecdsa(&SecpMessage::from_digest(digest), &self.keys.secret_key);

        let rsa_key = crypto::parse_rsa_connection(connection)?;
        let expire = last_rotation + self.committee_size + rand::thread_rng().gen_range(0..10);
        Ok(MsgInvitation {
            to: *target,
            expire,
            sig: signature.serialize_der().to_vec(),
            msg: crypto::encrypt_invitation(&rsa_key, &serialized)?,
        })
    }

    /// Processes an inbound invitation envelope.
    pub fn handle_invitation(&self, msg: &MsgInvitation) -> InvitationAction {
        let last_rotation = self.chain.best_snapshot().last_rotation;
        if last_rotation > msg.expire {
            return InvitationAction::Ignore;
        }

        let rsa_key = match &self.keys.rsa_key {
            Some(key) => key,
            None => return self.relay_action(msg),
        };
        let plaintext = match crypto::decrypt_invitation(rsa_key, &msg.msg) {
            Ok(plaintext) => plaintext,
            // Not addressed to us; relay with deduplication.
            Err(_) => return self.relay_action(msg),
        };

        match self.accept_invitation(msg, &plaintext, last_rotation) {
            Ok(action) => action,
            Err(err) => {
                log::info!("refusing invitation: {}", err);
                InvitationAction::Ignore
            }
        }
    }

    fn accept_invitation(
        &self,
        msg: &MsgInvitation,
        plaintext: &[u8],
        last_rotation: u32,
    ) -> anyhow::Result<InvitationAction> {
        let mut cur = Cursor::new(plaintext);
        let payload = messages::get_invitation_payload(&mut cur)?;

        let n = self.committee_size;
        ensure!(
            last_rotation <= payload.height + n && payload.height < last_rotation + n,
            "invitation height {} outside the committee window at {}",
            payload.height,
            last_rotation
        );

        let (member, _) = self.validate_payload_signature(&payload, &msg.sig)?;
        ensure!(
            member != self.keys.member_id,
            "invitation claims our own identity"
        );

        let address = String::from_utf8(payload.ip.clone())?;
        let ack = self.make_ack(last_rotation)?;
        Ok(InvitationAction::Accept {
            member,
            miner_height: payload.height,
            address,
            ack,
        })
    }

    /// Validates an acknowledgement, returning the responding member and its
    /// miner height.
    pub fn handle_ack(&self, msg: &AckInvitation) -> anyhow::Result<(MemberId, u32)> {
        let last_rotation = self.chain.best_snapshot().last_rotation;
        let n = self.committee_size;
        let height = msg.invitation.height;
        ensure!(
            last_rotation <= height + n && height < last_rotation + n,
            "ack height {} outside the committee window at {}",
            height,
            last_rotation
        );

        let (member, _) = self.validate_payload_signature(&msg.invitation, &msg.sig)?;
        ensure!(member != self.keys.member_id, "ack claims our own identity");
        Ok((member, height))
    }

    /// Checks that a payload's public key matches the miner block at its
    /// stated height and that the signature commits to the payload bytes.
    fn validate_payload_signature(
        &self,
        payload: &InvitationPayload,
        sig: &[u8],
    ) -> anyhow::Result<(MemberId, PublicKey)> {
        let block = self
            .chain
            .miner_block_by_height(payload.height)
            .ok_or_else(|| format_err!("no miner block at height {}", payload.height))?;

        let pubkey = PublicKey::from_slice(&payload.pubkey)?;
        ensure!(
            crypto::member_id_for_pubkey(&pubkey) == block.miner,
            "invitation public key does not hash to miner {}",
            block.miner
        );

        let mut serialized = Vec::with_capacity(64);
        messages::put_invitation_payload(&mut serialized, payload);
        let digest = crypto::double_sha256(&serialized);
        let signature = ecdsa::Signature::from_der(sig)?;
        self.secp
            .verify_ecdsa(&SecpMessage::from_digest(digest), &signature, &pubkey)?;
        Ok((block.miner, pubkey))
    }

    fn make_ack(&self, last_rotation: u32) -> anyhow::Result<AckInvitation> {
        let me = self
            .my_place_in_committee(last_rotation)
            .ok_or_else(|| format_err!("this node is not in the committee window"))?;
        let payload = InvitationPayload {
            height: me,
            pubkey: PublicKey::from_secret_key(&self.secp, &self.keys.secret_key).serialize(),
            ip: self.external_address.as_bytes().to_vec(),
        };
        let mut serialized = Vec::with_capacity(64);
        messages::put_invitation_payload(&mut serialized, &payload);
        let digest = crypto::double_sha256(&serialized);
        let signature = self
            .secp
            .sign_ecdsa(&SecpMessage::from_digest(digest), &self.keys.secret_key);
        Ok(AckInvitation {
            sig: signature.serialize_der().to_vec(),
            invitation: payload,
        })
    }

    /// Deduplicated relay decision for envelopes we cannot decrypt.
    fn relay_action(&self, msg: &MsgInvitation) -> InvitationAction {
        let digest = crypto::double_sha256(&msg.msg);
        let now = unix_now();
        let mut inventory = self.broadcasted.lock().unwrap();

        if let Some(&expiry) = inventory.get(&digest) {
            if now <= expiry {
                inventory.insert(digest, now + INVENTORY_EXPIRY_SECS);
                return InvitationAction::Ignore;
            }
        }

        inventory.retain(|_, &mut expiry| now <= expiry);
        inventory.insert(digest, now + INVENTORY_EXPIRY_SECS);
        InvitationAction::Rebroadcast
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use rsa::RsaPrivateKey;
    use secp256k1::SecretKey;

    use super::*;
    use crate::{
        chain::{BestSnapshot, Block, BlockVerdict, MinerBlock},
        crypto::RsaConnection,
        helpers::{BlockHash, Height},
    };

    // Two-member miner chain: X (RSA reachability) at height 10, Y at 11.
    struct MinerChain {
        blocks: Vec<MinerBlock>,
        last_rotation: u32,
    }

    impl ChainView for MinerChain {
        fn best_snapshot(&self) -> BestSnapshot {
            BestSnapshot {
                height: Height(40),
                last_rotation: self.last_rotation,
            }
        }

        fn miner_block_by_height(&self, height: u32) -> Option<MinerBlock> {
            self.blocks.iter().find(|block| block.height == height).cloned()
        }

        fn block_by_hash(&self, _hash: &BlockHash) -> Option<Arc<Block>> {
            None
        }

        fn process_block(&self, _block: Block) -> anyhow::Result<BlockVerdict> {
            unreachable!("invitations never submit blocks");
        }

        fn signing_key(&self, _member: &MemberId) -> Option<SecretKey> {
            None
        }
    }

    fn keys_with_rsa(rsa: Option<RsaPrivateKey>) -> Keys {
        let secret_key = SecretKey::new(&mut rand::thread_rng());
        let secp = Secp256k1::new();
        let member_id =
            crypto::member_id_for_pubkey(&PublicKey::from_secret_key(&secp, &secret_key));
        Keys {
            member_id,
            secret_key,
            rsa_key: rsa,
        }
    }

    fn setup() -> (Invitations, Invitations, Vec<u8>) {
        let rsa = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let x_keys = keys_with_rsa(Some(rsa.clone()));
        let y_keys = keys_with_rsa(None);
        let x_connection = RsaConnection::encode(&rsa.to_public_key());

        let chain = Arc::new(MinerChain {
            blocks: vec![
                MinerBlock {
                    height: 10,
                    miner: x_keys.member_id,
                    connection: x_connection.clone(),
                },
                MinerBlock {
                    height: 11,
                    miner: y_keys.member_id,
                    connection: b"10.0.0.9:8777".to_vec(),
                },
            ],
            last_rotation: 11,
        });

        let x = Invitations::new(chain.clone(), x_keys, "10.0.0.8:8777".to_owned(), 4);
        let y = Invitations::new(chain, y_keys, "10.0.0.9:8777".to_owned(), 4);
        (x, y, x_connection)
    }

    #[test]
    fn invitation_round_trip() {
        let (x, y, x_connection) = setup();

        let target = x.keys.member_id;
        let envelope = y.make_invitation_msg(&target, &x_connection).unwrap();
        assert!(envelope.expire >= 11 + 4);

        // X decrypts, validates Y against the miner chain, and accepts.
        let action = x.handle_invitation(&envelope);
        let (member, address, ack) = match action {
            InvitationAction::Accept {
                member,
                address,
                ack,
                miner_height,
            } => {
                assert_eq!(miner_height, 11);
                (member, address, ack)
            }
            other => panic!("expected acceptance, got {:?}", other),
        };
        assert_eq!(member, y.keys.member_id);
        assert_eq!(address, "10.0.0.9:8777");

        // Y validates X's acknowledgement.
        let (responder, height) = y.handle_ack(&ack).unwrap();
        assert_eq!(responder, x.keys.member_id);
        assert_eq!(height, 10);
    }

    #[test]
    fn non_addressee_relays_with_dedup() {
        let (x, y, x_connection) = setup();
        let envelope = y.make_invitation_msg(&x.keys.member_id, &x_connection).unwrap();

        // Y cannot decrypt its own envelope (no RSA key): relay, then dedup.
        assert!(matches!(
            y.handle_invitation(&envelope),
            InvitationAction::Rebroadcast
        ));
        assert!(matches!(
            y.handle_invitation(&envelope),
            InvitationAction::Ignore
        ));
    }

    #[test]
    fn expired_envelope_is_ignored() {
        let (x, y, x_connection) = setup();
        let mut envelope = y.make_invitation_msg(&x.keys.member_id, &x_connection).unwrap();
        envelope.expire = 3;
        assert!(matches!(
            x.handle_invitation(&envelope),
            InvitationAction::Ignore
        ));
    }

    #[test]
    fn tampered_signature_is_refused() {
        let (x, y, x_connection) = setup();
        let mut envelope = y.make_invitation_msg(&x.keys.member_id, &x_connection).unwrap();
        let last = envelope.sig.len() - 1;
        envelope.sig[last] ^= 0x01;
        assert!(matches!(
            x.handle_invitation(&envelope),
            InvitationAction::Ignore
        ));
    }
}
