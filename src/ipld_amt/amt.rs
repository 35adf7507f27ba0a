// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use multihash_codetable::Code;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::de::DeserializeOwned;
use fvm_ipld_encoding::ser::Serialize;
use fvm_ipld_encoding::CborStore;

use super::node::{CollapsedNode, Link};
use super::root::{CollapsedRoot, Root};
use super::{
    init_sized_vec, nodes_for_height, Error, Node, DEFAULT_BIT_WIDTH, MAX_HEIGHT, MAX_INDEX,
};

/// Array Mapped Trie over a block store, serializable to a CID.
///
/// Not thread-safe; a single message application owns its tries.
#[derive(Debug)]
pub struct Amt<V, BS> {
    root: Root<V>,
    block_store: BS,
    /// Remember the last flushed CID until the tree changes.
    flushed_cid: Option<Cid>,
}

impl<V: PartialEq, BS: Blockstore> PartialEq for Amt<V, BS> {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}

impl<V, BS> Amt<V, BS>
where
    BS: Blockstore,
{
    pub fn new(block_store: BS) -> Self {
        Self::new_with_bit_width(block_store, DEFAULT_BIT_WIDTH)
    }

    pub fn new_with_bit_width(block_store: BS, bit_width: u32) -> Self {
        Self {
            root: Root::new_with_bit_width(bit_width),
            block_store,
            flushed_cid: None,
        }
    }

    fn bit_width(&self) -> u32 {
        self.root.bit_width
    }

    pub fn height(&self) -> u32 {
        self.root.height
    }

    /// Count of elements in the `Amt`.
    pub fn count(&self) -> u64 {
        self.root.count
    }
}

impl<V, BS> Amt<V, BS>
where
    V: DeserializeOwned + Serialize,
    BS: Blockstore,
{
    /// Constructs an AMT with a block store and the Cid of the root.
    pub fn load(cid: &Cid, block_store: BS) -> Result<Self, Error> {
        Self::load_with_bit_width(cid, block_store, DEFAULT_BIT_WIDTH)
    }

    /// Loads an AMT that was built with a non-default bit width. The width
    /// is not serialized; reader and writer have to agree on it.
    pub fn load_with_bit_width(cid: &Cid, block_store: BS, bit_width: u32) -> Result<Self, Error> {
        let collapsed: CollapsedRoot<V> = block_store
            .get_cbor(cid)?
            .ok_or_else(|| Error::CidNotFound(cid.to_string()))?;

        if collapsed.height() > MAX_HEIGHT {
            return Err(Error::MaxHeight(collapsed.height(), MAX_HEIGHT));
        }

        Ok(Self {
            root: collapsed.expand(bit_width)?,
            block_store,
            flushed_cid: Some(*cid),
        })
    }

    /// Get value at index of AMT
    pub fn get(&self, i: u64) -> Result<Option<&V>, Error> {
        if i > MAX_INDEX {
            return Err(Error::OutOfRange(i));
        }

        if i >= nodes_for_height(self.bit_width(), self.height() + 1) {
            return Ok(None);
        }

        self.root
            .node
            .get(&self.block_store, self.height(), self.bit_width(), i)
    }

    /// Set value at index
    pub fn set(&mut self, i: u64, val: V) -> Result<(), Error> {
        if i > MAX_INDEX {
            return Err(Error::OutOfRange(i));
        }

        // Grow the tree until the index is addressable: wrap the current
        // root in a fresh node at slot 0 and bump the height.
        while i >= nodes_for_height(self.bit_width(), self.height() + 1) {
            if !self.root.node.is_empty() {
                let mut new_links: Vec<Option<Link<V>>> = init_sized_vec(self.root.bit_width);
                let node = std::mem::replace(&mut self.root.node, Node::empty());
                new_links[0] = Some(Link::Dirty(Box::new(node)));
                self.root.node = Node::Link { links: new_links };
            } else {
                // First expansion before any value was inserted.
                self.root.node = Node::Link {
                    links: init_sized_vec(self.bit_width()),
                };
            }
            self.root.height += 1;
        }

        if self
            .root
            .node
            .set(&self.block_store, self.height(), self.bit_width(), i, val)?
            .is_none()
        {
            self.root.count += 1;
        }

        self.flushed_cid = None;

        Ok(())
    }

    /// Appends `val` at the first index past the current count.
    pub fn append(&mut self, val: V) -> Result<(), Error> {
        self.set(self.count(), val)
    }

    /// Batch set from consecutive index zero (naive for now)
    pub fn batch_set(&mut self, vals: impl IntoIterator<Item = V>) -> Result<(), Error> {
        for (i, val) in (0u64..).zip(vals) {
            self.set(i, val)?;
        }

        Ok(())
    }

    /// Generates an AMT from an iterator of serializable values and
    /// returns its root.
    pub fn new_from_iter(
        block_store: BS,
        vals: impl IntoIterator<Item = V>,
    ) -> Result<Cid, Error> {
        let mut t = Self::new(block_store);
        t.batch_set(vals)?;
        t.flush()
    }

    /// Delete item from AMT at index, returning it if it was present.
    pub fn delete(&mut self, i: u64) -> Result<Option<V>, Error> {
        if i > MAX_INDEX {
            return Err(Error::OutOfRange(i));
        }

        if i >= nodes_for_height(self.bit_width(), self.height() + 1) {
            // Index was out of range of current AMT
            return Ok(None);
        }

        let deleted =
            self.root
                .node
                .delete(&self.block_store, self.height(), self.bit_width(), i)?;

        if deleted.is_none() {
            return Ok(None);
        }

        self.flushed_cid = None;
        self.root.count -= 1;

        if self.root.node.is_empty() {
            // Last entry removed, reset to an empty leaf.
            self.root.node = Node::Leaf {
                vals: init_sized_vec(self.root.bit_width),
            };
            self.root.height = 0;
        } else {
            // While the root holds a single link at slot 0, the child can
            // be promoted and the tree loses a level.
            while self.root.node.can_collapse() && self.height() > 0 {
                let sub_node: Node<V> = match &mut self.root.node {
                    Node::Link { links, .. } => match &mut links[0] {
                        Some(Link::Dirty(node)) => {
                            *std::mem::replace(node, Box::new(Node::empty()))
                        }
                        Some(Link::Cid { cid, cache }) => {
                            let cache_node = std::mem::take(cache);
                            if let Some(sn) = cache_node.into_inner() {
                                *sn
                            } else {
                                self.block_store
                                    .get_cbor::<CollapsedNode<V>>(cid)?
                                    .ok_or_else(|| Error::CidNotFound(cid.to_string()))?
                                    .expand(self.root.bit_width)?
                            }
                        }
                        _ => unreachable!("first index checked to be Some in `can_collapse`"),
                    },
                    Node::Leaf { .. } => unreachable!("non-zero height cannot be a leaf node"),
                };

                self.root.node = sub_node;
                self.root.height -= 1;
            }
        }

        Ok(deleted)
    }

    /// Flush root and return Cid for the AMT
    pub fn flush(&mut self) -> Result<Cid, Error> {
        if let Some(cid) = self.flushed_cid {
            return Ok(cid);
        }
        self.root.node.flush(&self.block_store)?;
        let cid = self.block_store.put_cbor(&self.root, Code::Blake2b256)?;
        self.flushed_cid = Some(cid);
        Ok(cid)
    }

    /// Iterates over each value in the Amt in index order.
    #[inline]
    pub fn for_each<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<()>,
    {
        self.for_each_while(|i, x| {
            f(i, x)?;
            Ok(true)
        })
    }

    /// Iterates in index order for as long as the callback returns `true`.
    pub fn for_each_while<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<bool>,
    {
        self.root
            .node
            .for_each_while(
                &self.block_store,
                self.height(),
                self.bit_width(),
                0,
                &mut f,
            )
            .map(|_| ())
    }
}
