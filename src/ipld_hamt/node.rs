// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::borrow::Borrow;
use std::marker::PhantomData;

use multihash_codetable::Code;
use cid::Cid;
use forest_hash_utils::Hash;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::CborStore;
use once_cell::unsync::OnceCell;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::hash_bits::HashBits;
use super::pointer::Pointer;
use super::{Bitfield, Error, HashAlgorithm, KeyValuePair, MAX_ARRAY_WIDTH};

/// Node in the HAMT: a bitmap of occupied slots and one pointer per set
/// bit, in slot order.
#[derive(Debug)]
pub(crate) struct Node<K, V, H> {
    pub(crate) bitfield: Bitfield,
    pub(crate) pointers: Vec<Pointer<K, V, H>>,
    hash: PhantomData<H>,
}

impl<K: PartialEq, V: PartialEq, H> PartialEq for Node<K, V, H> {
    fn eq(&self, other: &Self) -> bool {
        (self.bitfield == other.bitfield) && (self.pointers == other.pointers)
    }
}

impl<K, V, H> Serialize for Node<K, V, H>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.bitfield, &self.pointers).serialize(serializer)
    }
}

impl<'de, K, V, H> Deserialize<'de> for Node<K, V, H>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (bitfield, pointers) = Deserialize::deserialize(deserializer)?;
        Ok(Node {
            bitfield,
            pointers,
            hash: Default::default(),
        })
    }
}

impl<K, V, H> Default for Node<K, V, H> {
    fn default() -> Self {
        Node {
            bitfield: Bitfield::zero(),
            pointers: Vec::new(),
            hash: Default::default(),
        }
    }
}

impl<K, V, H> Node<K, V, H>
where
    K: Hash + Eq + PartialOrd + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
    H: HashAlgorithm,
{
    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    #[inline]
    pub fn get<Q: ?Sized, S: Blockstore>(
        &self,
        key: &Q,
        store: &S,
        bit_width: u32,
    ) -> Result<Option<&V>, Error>
    where
        K: Borrow<Q>,
        Q: Eq + Hash,
    {
        let hash = H::hash(key);
        Ok(self
            .get_value(&mut HashBits::new(&hash), bit_width, key, store)?
            .map(|kv| kv.value()))
    }

    fn get_value<Q: ?Sized, S: Blockstore>(
        &self,
        hashed_key: &mut HashBits,
        bit_width: u32,
        key: &Q,
        store: &S,
    ) -> Result<Option<&KeyValuePair<K, V>>, Error>
    where
        K: Borrow<Q>,
        Q: Eq + Hash,
    {
        let idx = hashed_key.next(bit_width)?;

        if !self.bitfield.test_bit(idx) {
            return Ok(None);
        }

        let cindex = self.index_for_bit_pos(idx);
        match self.get_child(cindex) {
            Pointer::Link { cid, cache } => {
                let cached_node = cache.get_or_try_init(|| {
                    store
                        .get_cbor::<Node<K, V, H>>(cid)?
                        .ok_or_else(|| Error::CidNotFound(cid.to_string()))
                        .map(Box::new)
                })?;
                cached_node.get_value(hashed_key, bit_width, key, store)
            }
            Pointer::Dirty(n) => n.get_value(hashed_key, bit_width, key, store),
            Pointer::Values(vals) => Ok(vals.iter().find(|kv| key.eq(kv.key().borrow()))),
        }
    }

    /// Sets a key's value, returning the replaced value if the key was
    /// already present.
    pub fn set<S: Blockstore>(
        &mut self,
        key: K,
        value: V,
        store: &S,
        bit_width: u32,
    ) -> Result<Option<V>, Error> {
        let hash = H::hash(&key);
        self.modify_value(&mut HashBits::new(&hash), bit_width, key, value, store)
    }

    fn modify_value<S: Blockstore>(
        &mut self,
        hashed_key: &mut HashBits,
        bit_width: u32,
        key: K,
        value: V,
        store: &S,
    ) -> Result<Option<V>, Error> {
        let idx = hashed_key.next(bit_width)?;

        if !self.bitfield.test_bit(idx) {
            self.insert_child(idx, key, value);
            return Ok(None);
        }

        let cindex = self.index_for_bit_pos(idx);
        let child = self.get_child_mut(cindex);
        match child {
            Pointer::Link { cid, cache } => {
                cache.get_or_try_init(|| {
                    store
                        .get_cbor::<Node<K, V, H>>(cid)?
                        .ok_or_else(|| Error::CidNotFound(cid.to_string()))
                        .map(Box::new)
                })?;
                let child_node = cache.get_mut().expect("filled directly above");
                let replaced =
                    child_node.modify_value(hashed_key, bit_width, key, value, store)?;
                let node = std::mem::replace(child_node, Box::new(Node::default()));
                *child = Pointer::Dirty(node);
                Ok(replaced)
            }
            Pointer::Dirty(n) => n.modify_value(hashed_key, bit_width, key, value, store),
            Pointer::Values(vals) => {
                // Replace on key hit.
                if let Some(i) = vals.iter().position(|p| p.key() == &key) {
                    let old = std::mem::replace(&mut vals[i], KeyValuePair::new(key, value));
                    return Ok(Some(old.into_parts().1));
                }

                // Full bucket: push everything one level deeper. Entries
                // re-read their digests from this depth.
                if vals.len() >= MAX_ARRAY_WIDTH {
                    let consumed = hashed_key.consumed;
                    let mut sub = Node::<K, V, H>::default();
                    sub.modify_value(hashed_key, bit_width, key, value, store)?;
                    let kvs = std::mem::take(vals);
                    for p in kvs {
                        let hash = H::hash(p.key());
                        let (k, v) = p.into_parts();
                        sub.modify_value(
                            &mut HashBits::new_at_index(&hash, consumed),
                            bit_width,
                            k,
                            v,
                            store,
                        )?;
                    }
                    *child = Pointer::Dirty(Box::new(sub));
                    return Ok(None);
                }

                // Insert in key order to keep the encoding canonical.
                let max = vals.len();
                let idx = vals
                    .iter()
                    .position(|c| c.key() > &key)
                    .unwrap_or(max);
                vals.insert(idx, KeyValuePair::new(key, value));
                Ok(None)
            }
        }
    }

    /// Removes a key, returning the owned pair if it was present.
    pub fn remove_entry<Q: ?Sized, S: Blockstore>(
        &mut self,
        key: &Q,
        store: &S,
        bit_width: u32,
    ) -> Result<Option<(K, V)>, Error>
    where
        K: Borrow<Q>,
        Q: Eq + Hash,
    {
        let hash = H::hash(key);
        self.rm_value(&mut HashBits::new(&hash), bit_width, key, store)
    }

    fn rm_value<Q: ?Sized, S: Blockstore>(
        &mut self,
        hashed_key: &mut HashBits,
        bit_width: u32,
        key: &Q,
        store: &S,
    ) -> Result<Option<(K, V)>, Error>
    where
        K: Borrow<Q>,
        Q: Eq + Hash,
    {
        let idx = hashed_key.next(bit_width)?;

        if !self.bitfield.test_bit(idx) {
            return Ok(None);
        }

        let cindex = self.index_for_bit_pos(idx);
        let child = self.get_child_mut(cindex);
        match child {
            Pointer::Link { cid, cache } => {
                cache.get_or_try_init(|| {
                    store
                        .get_cbor::<Node<K, V, H>>(cid)?
                        .ok_or_else(|| Error::CidNotFound(cid.to_string()))
                        .map(Box::new)
                })?;
                let child_node = cache.get_mut().expect("filled directly above");
                let deleted = child_node.rm_value(hashed_key, bit_width, key, store)?;
                if deleted.is_none() {
                    return Ok(None);
                }
                let node = std::mem::replace(child_node, Box::new(Node::default()));
                *child = Pointer::Dirty(node);
                child.clean()?;
                Ok(deleted)
            }
            Pointer::Dirty(n) => {
                let deleted = n.rm_value(hashed_key, bit_width, key, store)?;
                if deleted.is_none() {
                    return Ok(None);
                }
                child.clean()?;
                Ok(deleted)
            }
            Pointer::Values(vals) => {
                let Some(i) = vals.iter().position(|p| key.eq(p.key().borrow())) else {
                    return Ok(None);
                };
                if vals.len() == 1 {
                    let Pointer::Values(mut removed) = self.rm_child(cindex, idx) else {
                        unreachable!("pointer kind checked above");
                    };
                    Ok(Some(removed.remove(0).into_parts()))
                } else {
                    Ok(Some(vals.remove(i).into_parts()))
                }
            }
        }
    }

    /// Flushes dirty children bottom-up, replacing them with CID links.
    pub fn flush<S: Blockstore>(&mut self, store: &S) -> Result<(), Error> {
        for pointer in &mut self.pointers {
            if let Pointer::Dirty(node) = pointer {
                node.flush(store)?;
                let cid = store.put_cbor(node, Code::Blake2b256)?;
                let cache = OnceCell::from(std::mem::replace(node, Box::new(Node::default())));
                *pointer = Pointer::Link { cid, cache };
            }
        }
        Ok(())
    }

    /// Unordered iteration over every key-value pair in the subtree.
    pub fn for_each<S, F>(&self, store: &S, f: &mut F) -> Result<(), Error>
    where
        S: Blockstore,
        F: FnMut(&K, &V) -> anyhow::Result<()>,
    {
        for p in &self.pointers {
            match p {
                Pointer::Link { cid, cache } => {
                    let node = cache.get_or_try_init(|| {
                        store
                            .get_cbor::<Node<K, V, H>>(cid)?
                            .ok_or_else(|| Error::CidNotFound(cid.to_string()))
                            .map(Box::new)
                    })?;
                    node.for_each(store, f)?;
                }
                Pointer::Dirty(n) => n.for_each(store, f)?,
                Pointer::Values(vals) => {
                    for kv in vals {
                        f(kv.key(), kv.value())?;
                    }
                }
            }
        }
        Ok(())
    }

    fn index_for_bit_pos(&self, bp: u32) -> usize {
        let mask = Bitfield::zero().set_bits_le(bp);
        debug_assert_eq!(mask.count_ones(), bp as usize);
        mask.and(&self.bitfield).count_ones()
    }

    fn get_child(&self, i: usize) -> &Pointer<K, V, H> {
        &self.pointers[i]
    }

    fn get_child_mut(&mut self, i: usize) -> &mut Pointer<K, V, H> {
        &mut self.pointers[i]
    }

    fn insert_child(&mut self, idx: u32, key: K, value: V) {
        let i = self.index_for_bit_pos(idx);
        self.bitfield.set_bit(idx);
        self.pointers.insert(i, Pointer::from_key_value(key, value))
    }

    fn rm_child(&mut self, cindex: usize, idx: u32) -> Pointer<K, V, H> {
        self.bitfield.clear_bit(idx);
        self.pointers.remove(cindex)
    }
}
