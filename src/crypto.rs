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

//! Cryptographic primitives of the consensus protocol.
//!
//! Consensus signatures are secp256k1 ECDSA over a double-SHA256 digest,
//! carried on the wire as a 33-byte compressed public key followed by the
//! DER-encoded signature. Member identities are the HASH160 of the
//! compressed public key. Invitation payloads are encrypted with RSA-OAEP.

use anyhow::{bail, ensure};
use ripemd::Ripemd160;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::helpers::{BlockHash, Height, MemberId, MEMBER_ID_LENGTH};

/// Length of a compressed secp256k1 public key.
pub const PUBKEY_LENGTH: usize = 33;

/// OAEP label binding invitation ciphertexts to their purpose.
const INVITATION_LABEL: &str = "invitation";

/// Computes `SHA256(SHA256(data))`.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    second.into()
}

/// Digest every consensus signature for a candidate block commits to:
/// `SHA256(SHA256(le32(height) ‖ tree_hash))`.
pub fn sig_hash(height: Height, tree_hash: &BlockHash) -> [u8; 32] {
    let mut buf = Vec::with_capacity(4 + tree_hash.as_bytes().len());
    buf.extend_from_slice(&height.0.to_le_bytes());
    buf.extend_from_slice(tree_hash.as_bytes());
    double_sha256(&buf)
}

/// Derives the member identity of a public key: `RIPEMD160(SHA256(pubkey))`
/// over the compressed serialization.
pub fn member_id_for_pubkey(pubkey: &PublicKey) -> MemberId {
    let sha = Sha256::digest(&pubkey.serialize());
    let hash: [u8; MEMBER_ID_LENGTH] = Ripemd160::digest(&sha).into();
    MemberId(hash)
}

/// Signs a digest, producing the wire blob `pubkey(33) ‖ DER signature`.
pub fn sign_consensus(secp: &Secp256k1<All>, key: &SecretKey, digest: [u8; 32]) -> Vec<u8> {
    let message = Message::from_digest(digest);
    let signature = secp.sign_ecdsa(&message, key);
    let mut blob = Vec::with_capacity(PUBKEY_LENGTH + 72);
    blob.extend_from_slice(&PublicKey::from_secret_key(secp, key).serialize());
    blob.extend_from_slice(&signature.serialize_der());
    blob
}

/// Verifies a `pubkey ‖ DER` blob against a digest.
///
/// Returns the embedded public key so callers can match it against a member
/// identity. Parse and verification failures are reported as errors; the
/// caller drops the message without punishing the sender, since signatures
/// may be mangled in transit.
pub fn verify_consensus(digest: [u8; 32], blob: &[u8]) -> anyhow::Result<PublicKey> {
    ensure!(blob.len() > PUBKEY_LENGTH, "signature blob too short");
    let pubkey = PublicKey::from_slice(&blob[..PUBKEY_LENGTH])?;
    let signature = ecdsa::Signature::from_der(&blob[PUBKEY_LENGTH..])?;
    let message = Message::from_digest(digest);
    Secp256k1::verification_only().verify_ecdsa(&message, &signature, &pubkey)?;
    Ok(pubkey)
}

/// JSON form of an RSA public key as published in a miner block `connection`
/// field: `{"n": <modulus bytes>, "e": <exponent>}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RsaConnection {
    /// Big-endian modulus bytes.
    pub n: Vec<u8>,
    /// Public exponent.
    pub e: u32,
}

impl RsaConnection {
    /// Encodes a public key into the miner-block JSON form.
    pub fn encode(key: &RsaPublicKey) -> Vec<u8> {
        use rsa::traits::PublicKeyParts;

        let conn = Self {
            n: key.n().to_bytes_be(),
            e: key
                .e()
                .to_bytes_be()
                .iter()
                .fold(0_u32, |acc, &byte| (acc << 8) | u32::from(byte)),
        };
        serde_json::to_vec(&conn).expect("RSA connection serialization cannot fail")
    }
}

/// Parses a miner block `connection` payload as an RSA public key.
pub fn parse_rsa_connection(connection: &[u8]) -> anyhow::Result<RsaPublicKey> {
    let conn: RsaConnection = serde_json::from_slice(connection)?;
    let key = RsaPublicKey::new(
        BigUint::from_bytes_be(&conn.n),
        BigUint::from(u64::from(conn.e)),
    )?;
    Ok(key)
}

/// Encrypts a serialized invitation for the given RSA public key.
pub fn encrypt_invitation(key: &RsaPublicKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let padding = Oaep::new_with_label::<Sha256, _>(INVITATION_LABEL);
    let ciphertext = key.encrypt(&mut rand::thread_rng(), padding, plaintext)?;
    Ok(ciphertext)
}

/// Attempts to decrypt an invitation ciphertext with the local RSA key.
///
/// Failure is the common case: every node tries to decrypt every flooded
/// invitation, and only the addressee succeeds.
pub fn decrypt_invitation(key: &RsaPrivateKey, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let padding = Oaep::new_with_label::<Sha256, _>(INVITATION_LABEL);
    match key.decrypt(padding, ciphertext) {
        Ok(plaintext) => Ok(plaintext),
        Err(_) => bail!("invitation is not addressed to this node"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use secp256k1::Secp256k1;

    use super::*;

    #[test]
    fn consensus_signature_round_trip() {
        let secp = Secp256k1::new();
        let key = SecretKey::new(&mut rand::thread_rng());
        let digest = sig_hash(Height(7), &BlockHash([3; 32]));

        let blob = sign_consensus(&secp, &key, digest);
        let pubkey = verify_consensus(digest, &blob).expect("valid signature");
        assert_eq!(pubkey, PublicKey::from_secret_key(&secp, &key));

        let other_digest = sig_hash(Height(8), &BlockHash([3; 32]));
        assert!(verify_consensus(other_digest, &blob).is_err());
    }

    #[test]
    fn mangled_signature_is_rejected() {
        let secp = Secp256k1::new();
        let key = SecretKey::new(&mut rand::thread_rng());
        let digest = sig_hash(Height(1), &BlockHash([9; 32]));

        let mut blob = sign_consensus(&secp, &key, digest);
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(verify_consensus(digest, &blob).is_err());
        assert!(verify_consensus(digest, &blob[..16]).is_err());
    }

    #[test]
    fn member_identity_is_stable() {
        let secp = Secp256k1::new();
        let key = SecretKey::new(&mut rand::thread_rng());
        let pubkey = PublicKey::from_secret_key(&secp, &key);
        assert_eq!(member_id_for_pubkey(&pubkey), member_id_for_pubkey(&pubkey));
    }

    #[test]
    fn rsa_connection_round_trip() {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let public = RsaPublicKey::from(&private);

        let encoded = RsaConnection::encode(&public);
        let decoded = parse_rsa_connection(&encoded).unwrap();
        assert_eq!(decoded, public);

        let ciphertext = encrypt_invitation(&decoded, b"hello committee").unwrap();
        let plaintext = decrypt_invitation(&private, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello committee");

        let other = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        assert!(decrypt_invitation(&other, &ciphertext).is_err());
    }
}
