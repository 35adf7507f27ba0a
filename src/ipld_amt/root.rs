// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::ser::{self, Serialize};
use serde::Deserialize;

use super::node::CollapsedNode;
use super::{init_sized_vec, Error, Node};

/// Root of an AMT: `[height, count, node]` on the wire. The bit width is a
/// property of the instance, agreed upon by writer and reader, and is not
/// serialized.
#[derive(PartialEq, Debug)]
pub(super) struct Root<V> {
    pub bit_width: u32,
    pub height: u32,
    pub count: u64,
    pub node: Node<V>,
}

impl<V> Root<V> {
    pub(super) fn new_with_bit_width(bit_width: u32) -> Self {
        Self {
            bit_width,
            count: 0,
            height: 0,
            node: Node::Leaf {
                vals: init_sized_vec(bit_width),
            },
        }
    }
}

impl<V> Serialize for Root<V>
where
    V: Serialize,
{
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        (&self.height, &self.count, &self.node).serialize(s)
    }
}

/// Wire form of the root; expanding requires the instance bit width.
#[derive(Deserialize)]
#[serde(bound = "V: serde::de::DeserializeOwned")]
pub(super) struct CollapsedRoot<V>(u32, u64, CollapsedNode<V>);

impl<V> CollapsedRoot<V> {
    pub(super) fn expand(self, bit_width: u32) -> Result<Root<V>, Error> {
        let CollapsedRoot(height, count, node) = self;
        Ok(Root {
            bit_width,
            height,
            count,
            node: node.expand(bit_width)?,
        })
    }

    pub(super) fn height(&self) -> u32 {
        self.0
    }
}
