// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::utils::cid::{CidVariant, BLAKE2B256_SIZE};
use ahash::HashSet;
use cid::Cid;

/// Set of visited CIDs used by reachability traversals.
///
/// Nearly all CIDs in a repository are `V1`/`dag-cbor`/BLAKE2b-256; those
/// are stored as bare 32-byte digests, a third of the in-memory size of a
/// full [`Cid`]. Everything else lands in a fallback set.
#[derive(Default)]
pub struct CidHashSet {
    v1_dagcbor_blake2b: HashSet<[u8; BLAKE2B256_SIZE]>,
    fallback: HashSet<Cid>,
}

impl CidHashSet {
    /// Adds a value to the set. Returns whether the value was absent.
    pub fn insert(&mut self, cid: Cid) -> bool {
        match cid.try_into() {
            Ok(CidVariant::V1DagCborBlake2b(bytes)) => self.v1_dagcbor_blake2b.insert(bytes),
            Err(()) => self.fallback.insert(cid),
        }
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        match (*cid).try_into() {
            Ok(CidVariant::V1DagCborBlake2b(bytes)) => self.v1_dagcbor_blake2b.contains(&bytes),
            Err(()) => self.fallback.contains(cid),
        }
    }

    pub fn len(&self) -> usize {
        self.v1_dagcbor_blake2b.len() + self.fallback.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v1_dagcbor_blake2b.is_empty() && self.fallback.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cid::CidCborExt;
    use multihash_codetable::{Code, MultihashDigest};

    #[test]
    fn insert_is_idempotent_across_variants() {
        let cbor = Cid::from_cbor_blake2b256(&1u64).unwrap();
        let raw = Cid::new_v1(fvm_ipld_encoding::IPLD_RAW, Code::Sha2_256.digest(b"raw"));
        let mut set = CidHashSet::default();
        assert!(set.insert(cbor));
        assert!(!set.insert(cbor));
        assert!(set.insert(raw));
        assert!(!set.insert(raw));
        assert_eq!(set.len(), 2);
        assert!(set.contains(&cbor) && set.contains(&raw));
    }
}
