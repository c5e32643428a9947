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

//! Basic types shared across the consensus subsystem.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

/// Length of a member identity (a miner address) in bytes.
pub const MEMBER_ID_LENGTH: usize = 20;
/// Length of a block hash in bytes.
pub const BLOCK_HASH_LENGTH: usize = 32;

/// Height of a main-chain block. The wire format carries heights as
/// little-endian `i32`, hence the inner type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Height(pub i32);

impl Height {
    /// Returns the height of the next block.
    pub fn next(self) -> Self {
        Height(self.0 + 1)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<i32> for Height {
    fn from(value: i32) -> Self {
        Height(value)
    }
}

/// Identity of a committee member: the 20-byte address of the miner that
/// produced the corresponding miner-chain block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemberId(pub [u8; MEMBER_ID_LENGTH]);

impl MemberId {
    /// Creates an identity from a byte slice.
    ///
    /// Returns `None` if the slice length differs from [`MEMBER_ID_LENGTH`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != MEMBER_ID_LENGTH {
            return None;
        }
        let mut id = [0; MEMBER_ID_LENGTH];
        id.copy_from_slice(bytes);
        Some(Self(id))
    }

    /// Returns the identity as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "MemberId({})", self)
    }
}

/// Hash of a candidate block. Displayed in the reversed byte order customary
/// for chain hashes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockHash(pub [u8; BLOCK_HASH_LENGTH]);

impl BlockHash {
    /// The all-zero hash, used as a placeholder before a tree is resolved.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Creates a hash from a byte slice.
    ///
    /// Returns `None` if the slice length differs from [`BLOCK_HASH_LENGTH`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BLOCK_HASH_LENGTH {
            return None;
        }
        let mut hash = [0; BLOCK_HASH_LENGTH];
        hash.copy_from_slice(bytes);
        Some(Self(hash))
    }

    /// Returns the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        formatter.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "BlockHash({})", self)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn member_id_round_trip() {
        let id = MemberId([0xab; MEMBER_ID_LENGTH]);
        assert_eq!(MemberId::from_slice(id.as_bytes()), Some(id));
        assert_eq!(MemberId::from_slice(&[0; 19]), None);
        assert_eq!(id.to_string(), "ab".repeat(MEMBER_ID_LENGTH));
    }

    #[test]
    fn block_hash_display_is_reversed() {
        let mut bytes = [0; BLOCK_HASH_LENGTH];
        bytes[0] = 1;
        let hash = BlockHash(bytes);
        let display = hash.to_string();
        assert!(display.ends_with("01"));
        assert!(display.starts_with("00"));
    }
}
