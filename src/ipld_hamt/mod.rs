// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Hash Array Mapped Trie: a map from byte keys to values, persisted as a
//! CID-linked trie with bitmap-indexed children.
//!
//! Keys are hashed once; successive `bit_width`-wide digits of the digest
//! index the levels of the trie. Leaves hold inline buckets of up to
//! [`MAX_ARRAY_WIDTH`] entries before splitting one level deeper, and
//! deletions collapse sparse subtrees back into inline buckets.

mod bitfield;
mod error;
mod hamt;
mod hash_algorithm;
mod hash_bits;
mod node;
mod pointer;

pub use self::error::Error;
pub use self::hamt::Hamt;
pub use self::hash_algorithm::{HashAlgorithm, Sha256};
pub use forest_hash_utils::{BytesKey, Hash};

use self::bitfield::Bitfield;

/// Default bit width: 32 child slots per node, the width the actor state
/// tree and the init actor address map are built with.
pub const DEFAULT_BIT_WIDTH: u32 = 5;

/// Inline buckets hold at most this many entries before splitting.
const MAX_ARRAY_WIDTH: usize = 3;

/// A key's digest is 256 bits; running out of digits means the trie is
/// deeper than the digest allows, which only happens with a broken hash.
type HashedKey = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct KeyValuePair<K, V>(K, V);

impl<K, V> KeyValuePair<K, V> {
    pub fn key(&self) -> &K {
        &self.0
    }

    pub fn value(&self) -> &V {
        &self.1
    }

    pub fn new(key: K, value: V) -> Self {
        KeyValuePair(key, value)
    }

    pub fn into_parts(self) -> (K, V) {
        (self.0, self.1)
    }
}

#[cfg(test)]
mod tests {
    mod hamt_tests;
}
