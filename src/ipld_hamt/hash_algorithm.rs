// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use forest_hash_utils::Hash;
use sha2::{Digest, Sha256 as Sha256Hasher};

use super::HashedKey;

/// Algorithm used to mix keys into the fixed-width digest the trie is
/// indexed by.
pub trait HashAlgorithm {
    fn hash<X: ?Sized>(key: &X) -> HashedKey
    where
        X: Hash;
}

/// Sha-256 key digest, the function every persisted map in the state
/// engine uses.
#[derive(Debug)]
pub enum Sha256 {}

impl HashAlgorithm for Sha256 {
    fn hash<X: ?Sized>(key: &X) -> HashedKey
    where
        X: Hash,
    {
        let mut hasher = Sha2HasherWrapper::default();
        key.hash(&mut hasher);
        hasher
            .0
            .finalize()
            .as_slice()
            .try_into()
            .expect("fixed digest size")
    }
}

/// Adapter feeding the `Hash` trait's byte stream into Sha-256. `finish`
/// is unused; the full digest is taken instead of a truncated `u64`.
#[derive(Default)]
struct Sha2HasherWrapper(Sha256Hasher);

impl std::hash::Hasher for Sha2HasherWrapper {
    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(&self) -> u64 {
        0
    }
}
