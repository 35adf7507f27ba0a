// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use multihash_codetable::Code;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{strict_bytes, BytesSer, CborStore};
use once_cell::unsync::OnceCell;
use serde::de::{self, DeserializeOwned};
use serde::{ser, Deserialize, Serialize};

use super::{bmap_bytes, init_sized_vec, nodes_for_height, Error};

/// Link to a child node: either a clean CID with a lazily-filled cache, or
/// a dirty in-memory child that has to be flushed before serializing.
#[derive(Debug)]
pub(super) enum Link<V> {
    Cid {
        cid: Cid,
        cache: OnceCell<Box<Node<V>>>,
    },
    Dirty(Box<Node<V>>),
}

impl<'de, V> Deserialize<'de> for Link<V>
where
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let cid: Cid = Deserialize::deserialize(deserializer)?;
        Ok(Link::from(cid))
    }
}

impl<V> PartialEq for Link<V>
where
    V: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Link::Cid { cid: a, .. }, Link::Cid { cid: b, .. }) => a == b,
            (Link::Dirty(a), Link::Dirty(b)) => a == b,
            _ => false,
        }
    }
}

impl<V> Eq for Link<V> where V: Eq {}

impl<V> From<Cid> for Link<V> {
    fn from(cid: Cid) -> Link<V> {
        Link::Cid {
            cid,
            cache: Default::default(),
        }
    }
}

/// A node is either an interior shard of links or a leaf shard of values.
#[derive(PartialEq, Eq, Debug)]
#[allow(clippy::large_enum_variant)]
pub(super) enum Node<V> {
    Link { links: Vec<Option<Link<V>>> },
    Leaf { vals: Vec<Option<V>> },
}

impl<V> Serialize for Node<V>
where
    V: Serialize,
{
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        match &self {
            Node::Leaf { vals } => {
                let mut values = Vec::<&V>::with_capacity(vals.len());
                let mut bmap = vec![0u8; ((vals.len().saturating_sub(1)) / 8) + 1];
                for (i, v) in vals.iter().enumerate() {
                    if let Some(val) = v {
                        values.push(val);
                        bmap[i / 8] |= 1 << (i % 8);
                    }
                }
                (BytesSer(&bmap), Vec::<&Cid>::new(), values).serialize(s)
            }
            Node::Link { links } => {
                let mut collapsed = Vec::<&Cid>::with_capacity(links.len());
                let mut bmap = vec![0u8; ((links.len().saturating_sub(1)) / 8) + 1];
                for (i, v) in links.iter().enumerate() {
                    if let Some(val) = v {
                        if let Link::Cid { cid, .. } = val {
                            collapsed.push(cid);
                            bmap[i / 8] |= 1 << (i % 8);
                        } else {
                            return Err(ser::Error::custom(Error::Cached));
                        }
                    }
                }
                (BytesSer(&bmap), collapsed, Vec::<&V>::new()).serialize(s)
            }
        }
    }
}

/// Wire form of a node: `[bitmap bytes, links, values]`. Expanding
/// re-derives the sparse slot vector from the bitmap.
#[derive(Serialize, Deserialize)]
pub(super) struct CollapsedNode<V>(#[serde(with = "strict_bytes")] Vec<u8>, Vec<Cid>, Vec<V>);

impl<V> CollapsedNode<V> {
    pub(super) fn expand(self, bit_width: u32) -> Result<Node<V>, Error> {
        let CollapsedNode(bmap, links, values) = self;
        if !links.is_empty() && !values.is_empty() {
            return Err(Error::LinksAndValues);
        }

        if bmap_bytes(bit_width) != bmap.len() {
            return Err(anyhow::anyhow!(
                "expected bitfield of length {}, found bitfield with length {}",
                bmap_bytes(bit_width),
                bmap.len()
            )
            .into());
        }

        let set = |i: usize| bmap[i / 8] & (1 << (i % 8)) != 0;

        if !links.is_empty() {
            let mut links_iter = links.into_iter();
            let mut slots = init_sized_vec::<Link<V>>(bit_width);
            for (i, slot) in slots.iter_mut().enumerate() {
                if set(i) {
                    *slot = Some(Link::from(links_iter.next().ok_or_else(|| {
                        anyhow::anyhow!("bitmap contained more set bits than links provided")
                    })?))
                }
            }
            if links_iter.next().is_some() {
                return Err(anyhow::anyhow!("bitmap contained fewer set bits than links").into());
            }
            Ok(Node::Link { links: slots })
        } else {
            let mut val_iter = values.into_iter();
            let mut slots = init_sized_vec::<V>(bit_width);
            for (i, slot) in slots.iter_mut().enumerate() {
                if set(i) {
                    *slot = Some(val_iter.next().ok_or_else(|| {
                        anyhow::anyhow!("bitmap contained more set bits than values provided")
                    })?)
                }
            }
            if val_iter.next().is_some() {
                return Err(anyhow::anyhow!("bitmap contained fewer set bits than values").into());
            }
            Ok(Node::Leaf { vals: slots })
        }
    }
}

impl<V> Node<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Empty node, invalid as a serialized form; used as a placeholder to
    /// move nodes without cloning.
    pub(super) fn empty() -> Self {
        Node::Leaf {
            vals: Default::default(),
        }
    }

    /// Flushes dirty children bottom-up, replacing them with `Cid` links.
    pub(super) fn flush<DB: Blockstore>(&mut self, bs: &DB) -> Result<(), Error> {
        if let Node::Link { links } = self {
            for link in links.iter_mut().flatten() {
                if let Link::Dirty(n) = link {
                    n.flush(bs)?;
                    let cid = bs.put_cbor(n, Code::Blake2b256)?;
                    let existing = std::mem::replace(n, Box::new(Node::empty()));
                    *link = Link::Cid {
                        cid,
                        cache: OnceCell::from(existing),
                    };
                }
            }
        }

        Ok(())
    }

    /// True when the only occupied slot is a link at index 0, in which case
    /// the child can replace this node and the tree loses a level.
    pub(super) fn can_collapse(&self) -> bool {
        match self {
            Node::Link { links } => {
                links.first().and_then(|l| l.as_ref()).is_some()
                    && links
                        .get(1..)
                        .map(|l| l.iter().all(|l| l.is_none()))
                        .unwrap_or(true)
            }
            Node::Leaf { .. } => false,
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        match self {
            Node::Link { links } => links.iter().all(|l| l.is_none()),
            Node::Leaf { vals } => vals.iter().all(|l| l.is_none()),
        }
    }

    fn load_cached<'a, DB: Blockstore>(
        bs: &DB,
        cid: &Cid,
        cache: &'a OnceCell<Box<Node<V>>>,
        bit_width: u32,
    ) -> Result<&'a Node<V>, Error> {
        let node = cache.get_or_try_init(|| {
            bs.get_cbor::<CollapsedNode<V>>(cid)?
                .ok_or_else(|| Error::CidNotFound(cid.to_string()))?
                .expand(bit_width)
                .map(Box::new)
        })?;
        Ok(node)
    }

    pub(super) fn get<DB: Blockstore>(
        &self,
        bs: &DB,
        height: u32,
        bit_width: u32,
        i: u64,
    ) -> Result<Option<&V>, Error> {
        match self {
            Node::Leaf { vals } => Ok(vals.get(i as usize).and_then(|v| v.as_ref())),
            Node::Link { links } => {
                let nfh = nodes_for_height(bit_width, height);
                match links.get((i / nfh) as usize).and_then(|v| v.as_ref()) {
                    Some(Link::Cid { cid, cache }) => Self::load_cached(bs, cid, cache, bit_width)?
                        .get(bs, height - 1, bit_width, i % nfh),
                    Some(Link::Dirty(n)) => n.get(bs, height - 1, bit_width, i % nfh),
                    None => Ok(None),
                }
            }
        }
    }

    /// Sets a value, returning the previous value at the index if any.
    pub(super) fn set<DB: Blockstore>(
        &mut self,
        bs: &DB,
        height: u32,
        bit_width: u32,
        i: u64,
        val: V,
    ) -> Result<Option<V>, Error> {
        if height == 0 {
            return Ok(self.set_leaf(i, val));
        }

        let nfh = nodes_for_height(bit_width, height);
        let idx = (i / nfh) as usize;

        let Node::Link { links } = self else {
            unreachable!("non-zero height is always a link node");
        };

        links[idx] = match &mut links[idx] {
            Some(Link::Cid { cid, cache }) => {
                let cache_node = std::mem::take(cache);
                let sub_node = if let Some(sn) = cache_node.into_inner() {
                    sn
                } else {
                    bs.get_cbor::<CollapsedNode<V>>(cid)?
                        .ok_or_else(|| Error::CidNotFound(cid.to_string()))?
                        .expand(bit_width)
                        .map(Box::new)?
                };
                Some(Link::Dirty(sub_node))
            }
            None => {
                let node = match height {
                    1 => Node::Leaf {
                        vals: init_sized_vec(bit_width),
                    },
                    _ => Node::Link {
                        links: init_sized_vec(bit_width),
                    },
                };
                Some(Link::Dirty(Box::new(node)))
            }
            Some(Link::Dirty(node)) => return node.set(bs, height - 1, bit_width, i % nfh, val),
        };

        if let Some(Link::Dirty(n)) = &mut links[idx] {
            n.set(bs, height - 1, bit_width, i % nfh, val)
        } else {
            unreachable!("link replaced with dirty variant above")
        }
    }

    fn set_leaf(&mut self, i: u64, val: V) -> Option<V> {
        match self {
            Node::Leaf { vals } => std::mem::replace(&mut vals[i as usize], Some(val)),
            Node::Link { .. } => panic!("set_leaf called on a link node"),
        }
    }

    /// Deletes a value, pruning emptied children along the way.
    pub(super) fn delete<DB: Blockstore>(
        &mut self,
        bs: &DB,
        height: u32,
        bit_width: u32,
        i: u64,
    ) -> Result<Option<V>, Error> {
        match self {
            Self::Leaf { vals } => Ok(vals.get_mut(i as usize).and_then(std::mem::take)),
            Self::Link { links } => {
                let nfh = nodes_for_height(bit_width, height);
                let sub_i = (i / nfh) as usize;
                let (deleted, replace) = match &mut links[sub_i] {
                    Some(Link::Dirty(n)) => {
                        let deleted = n.delete(bs, height - 1, bit_width, i % nfh)?;
                        if deleted.is_none() {
                            return Ok(None);
                        }
                        if !n.is_empty() {
                            return Ok(deleted);
                        }
                        (deleted, None)
                    }
                    Some(Link::Cid { cid, cache }) => {
                        cache.get_or_try_init(|| {
                            bs.get_cbor::<CollapsedNode<V>>(cid)?
                                .ok_or_else(|| Error::CidNotFound(cid.to_string()))?
                                .expand(bit_width)
                                .map(Box::new)
                        })?;
                        let sub_node = cache.get_mut().expect("filled directly above");
                        let deleted = sub_node.delete(bs, height - 1, bit_width, i % nfh)?;
                        if deleted.is_none() {
                            return Ok(None);
                        };
                        let sub_node = std::mem::replace(sub_node, Box::new(Node::empty()));
                        if sub_node.is_empty() {
                            (deleted, None)
                        } else {
                            (deleted, Some(Link::Dirty(sub_node)))
                        }
                    }
                    None => return Ok(None),
                };

                links[sub_i] = replace;

                Ok(deleted)
            }
        }
    }

    pub(super) fn for_each_while<DB, F>(
        &self,
        bs: &DB,
        height: u32,
        bit_width: u32,
        offset: u64,
        f: &mut F,
    ) -> Result<bool, Error>
    where
        F: FnMut(u64, &V) -> anyhow::Result<bool>,
        DB: Blockstore,
    {
        match self {
            Node::Leaf { vals } => {
                for (i, v) in (0..).zip(vals.iter()) {
                    if let Some(v) = v {
                        if !f(offset + i, v)? {
                            return Ok(false);
                        }
                    }
                }
            }
            Node::Link { links } => {
                for (i, l) in (0..).zip(links.iter()) {
                    if let Some(l) = l {
                        let offs = offset + (i * nodes_for_height(bit_width, height));
                        let keep_going = match l {
                            Link::Dirty(sub) => {
                                sub.for_each_while(bs, height - 1, bit_width, offs, f)?
                            }
                            Link::Cid { cid, cache } => {
                                Self::load_cached(bs, cid, cache, bit_width)?
                                    .for_each_while(bs, height - 1, bit_width, offs, f)?
                            }
                        };
                        if !keep_going {
                            return Ok(false);
                        }
                    }
                }
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use fvm_ipld_encoding::{from_slice, to_vec};

    use super::*;

    #[test]
    fn serialize_node_symmetric() {
        let node = Node::Leaf { vals: vec![None] };
        let nbz = to_vec(&node).unwrap();
        assert_eq!(
            from_slice::<CollapsedNode<u8>>(&nbz)
                .unwrap()
                .expand(0)
                .unwrap(),
            node
        );
    }
}
