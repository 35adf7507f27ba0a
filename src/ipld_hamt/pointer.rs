// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::Ordering;
use std::marker::PhantomData;

use cid::Cid;
use once_cell::unsync::OnceCell;
use serde::de::{self, DeserializeOwned};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::node::Node;
use super::{Error, KeyValuePair, MAX_ARRAY_WIDTH};

/// Pointer to a child node or an inline bucket of values.
///
/// On the wire a pointer is a single-entry map: `{"0": cid}` for a child
/// link, `{"1": [[key, value], …]}` for a bucket.
#[derive(Debug)]
pub(crate) enum Pointer<K, V, H> {
    Values(Vec<KeyValuePair<K, V>>),
    Link {
        cid: Cid,
        cache: OnceCell<Box<Node<K, V, H>>>,
    },
    Dirty(Box<Node<K, V, H>>),
}

impl<K: PartialEq, V: PartialEq, H> PartialEq for Pointer<K, V, H> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Pointer::Values(a), Pointer::Values(b)) => a == b,
            (Pointer::Link { cid: a, .. }, Pointer::Link { cid: b, .. }) => a == b,
            (Pointer::Dirty(a), Pointer::Dirty(b)) => a == b,
            _ => false,
        }
    }
}

impl<K, V, H> Serialize for Pointer<K, V, H>
where
    K: Serialize,
    V: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Pointer::Link { cid, .. } => map.serialize_entry("0", cid)?,
            Pointer::Values(vals) => map.serialize_entry("1", vals)?,
            Pointer::Dirty(_) => return Err(serde::ser::Error::custom(Error::Cached)),
        }
        map.end()
    }
}

impl<'de, K, V, H> Deserialize<'de> for Pointer<K, V, H>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PointerVisitor<K, V, H>(PhantomData<(K, V, H)>);

        impl<'de, K, V, H> de::Visitor<'de> for PointerVisitor<K, V, H>
        where
            K: DeserializeOwned,
            V: DeserializeOwned,
        {
            type Value = Pointer<K, V, H>;

            fn expecting(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                fmt.write_str("a single-entry map keyed \"0\" (link) or \"1\" (bucket)")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let tag: String = map
                    .next_key()?
                    .ok_or_else(|| de::Error::custom("pointer map is empty"))?;
                let pointer = match tag.as_str() {
                    "0" => {
                        let cid: Cid = map.next_value()?;
                        Pointer::Link {
                            cid,
                            cache: Default::default(),
                        }
                    }
                    "1" => {
                        let vals: Vec<KeyValuePair<K, V>> = map.next_value()?;
                        Pointer::Values(vals)
                    }
                    other => {
                        return Err(de::Error::custom(format!("unknown pointer tag {other:?}")))
                    }
                };
                if map.next_key::<String>()?.is_some() {
                    return Err(de::Error::custom("pointer map has more than one entry"));
                }
                Ok(pointer)
            }
        }

        deserializer.deserialize_map(PointerVisitor(PhantomData))
    }
}

impl<K, V, H> Default for Pointer<K, V, H> {
    fn default() -> Self {
        Pointer::Values(Vec::new())
    }
}

impl<K, V, H> Pointer<K, V, H>
where
    K: PartialOrd,
{
    pub(crate) fn from_key_value(key: K, value: V) -> Self {
        Pointer::Values(vec![KeyValuePair::new(key, value)])
    }

    /// Collapses a subtree after a deletion to keep the representation
    /// canonical: a child that is down to a single bucket, or whose
    /// buckets fit in one, is promoted inline.
    pub(crate) fn clean(&mut self) -> Result<(), Error> {
        match self {
            Pointer::Dirty(n) => match n.pointers.len() {
                0 => Err(Error::ZeroPointers),
                1 => {
                    if let Pointer::Values(vals) = &mut n.pointers[0] {
                        // Take the single bucket to keep canonical ordering.
                        let values = std::mem::take(vals);
                        *self = Pointer::Values(values);
                    }
                    Ok(())
                }
                2..=MAX_ARRAY_WIDTH => {
                    let mut children_len = 0;
                    for c in n.pointers.iter() {
                        if let Pointer::Values(vals) = c {
                            children_len += vals.len();
                        } else {
                            return Ok(());
                        }
                    }
                    if children_len > MAX_ARRAY_WIDTH {
                        return Ok(());
                    }

                    let mut child_vals: Vec<KeyValuePair<K, V>> = n
                        .pointers
                        .iter_mut()
                        .filter_map(|p| {
                            if let Pointer::Values(kvs) = p {
                                Some(std::mem::take(kvs))
                            } else {
                                None
                            }
                        })
                        .flatten()
                        .collect();

                    // Bucket order is key order; restore it across the
                    // merged children.
                    child_vals.sort_unstable_by(|a, b| {
                        a.key().partial_cmp(b.key()).unwrap_or(Ordering::Equal)
                    });

                    *self = Pointer::Values(child_vals);
                    Ok(())
                }
                _ => Ok(()),
            },
            _ => unreachable!("clean is only called on dirty pointers"),
        }
    }
}
