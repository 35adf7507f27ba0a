// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::borrow::Borrow;
use std::marker::PhantomData;

use multihash_codetable::Code;
use cid::Cid;
use forest_hash_utils::{BytesKey, Hash};
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::CborStore;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::hash_algorithm::Sha256;
use super::node::Node;
use super::{Error, HashAlgorithm, DEFAULT_BIT_WIDTH};

/// Hash Array Mapped Trie over a block store, serializable to a CID.
///
/// Not thread-safe; a single message application owns its tries.
#[derive(Debug)]
pub struct Hamt<BS, V, K = BytesKey, H = Sha256> {
    root: Node<K, V, H>,
    store: BS,
    bit_width: u32,
    /// Remember the last flushed CID until the tree changes.
    flushed_cid: Option<Cid>,
    hash: PhantomData<H>,
}

impl<BS, V, K, H> Hamt<BS, V, K, H>
where
    K: Hash + Eq + PartialOrd + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
    H: HashAlgorithm,
    BS: Blockstore,
{
    pub fn new(store: BS) -> Self {
        Self::new_with_bit_width(store, DEFAULT_BIT_WIDTH)
    }

    /// Construct a HAMT with a custom fan-out of `2^bit_width`.
    pub fn new_with_bit_width(store: BS, bit_width: u32) -> Self {
        Self {
            root: Node::default(),
            store,
            bit_width,
            flushed_cid: None,
            hash: Default::default(),
        }
    }

    /// Load a HAMT from the store at the given root.
    pub fn load(cid: &Cid, store: BS) -> Result<Self, Error> {
        Self::load_with_bit_width(cid, store, DEFAULT_BIT_WIDTH)
    }

    /// Load a HAMT that was built with a non-default bit width; reader and
    /// writer have to agree on it, the width is not serialized.
    pub fn load_with_bit_width(cid: &Cid, store: BS, bit_width: u32) -> Result<Self, Error> {
        let root = store
            .get_cbor(cid)?
            .ok_or_else(|| Error::CidNotFound(cid.to_string()))?;
        Ok(Self {
            root,
            store,
            bit_width,
            flushed_cid: Some(*cid),
            hash: Default::default(),
        })
    }

    pub fn store(&self) -> &BS {
        &self.store
    }

    pub fn into_store(self) -> BS {
        self.store
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Inserts a key-value pair, returning the replaced value if the key
    /// was already present.
    pub fn set(&mut self, key: K, value: V) -> Result<Option<V>, Error> {
        let replaced = self.root.set(key, value, &self.store, self.bit_width)?;
        self.flushed_cid = None;
        Ok(replaced)
    }

    #[inline]
    pub fn get<Q: ?Sized>(&self, k: &Q) -> Result<Option<&V>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.root.get(k, &self.store, self.bit_width)
    }

    #[inline]
    pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> Result<bool, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        Ok(self.get(k)?.is_some())
    }

    /// Removes a key from the map, returning the owned key-value pair if
    /// it was present.
    pub fn delete<Q: ?Sized>(&mut self, k: &Q) -> Result<Option<(K, V)>, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        let deleted = self.root.remove_entry(k, &self.store, self.bit_width)?;
        if deleted.is_some() {
            self.flushed_cid = None;
        }
        Ok(deleted)
    }

    /// Flush the root and return the Cid for the HAMT.
    pub fn flush(&mut self) -> Result<Cid, Error> {
        if let Some(cid) = self.flushed_cid {
            return Ok(cid);
        }
        self.root.flush(&self.store)?;
        let cid = self.store.put_cbor(&self.root, Code::Blake2b256)?;
        self.flushed_cid = Some(cid);
        Ok(cid)
    }

    /// Iterates over every key-value pair; the order is a function of the
    /// key hashes, not of insertion.
    #[inline]
    pub fn for_each<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&K, &V) -> anyhow::Result<()>,
    {
        self.root.for_each(&self.store, &mut f)
    }
}
