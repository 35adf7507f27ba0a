// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Array Mapped Trie: a sparse ordered array keyed by `u64`, persisted as
//! a CID-linked trie of fixed fan-out nodes.
//!
//! Data structure reference:
//! <https://github.com/ipld/specs/blob/51fab05b4fe4930d3d851d50cc1e5f1a02092deb/data-structures/vector.md>

mod amt;
mod error;
mod node;
mod root;

pub use self::amt::Amt;
pub use self::error::Error;
use self::node::Node;

/// Default bit width: every node addresses `2^3 = 8` slots.
const DEFAULT_BIT_WIDTH: u32 = 3;
const MAX_HEIGHT: u32 = 64;

/// Maximum index addressable by the AMT. `u64::MAX - 1` so `count` cannot
/// overflow.
pub const MAX_INDEX: u64 = u64::MAX - 1;

/// Number of indices a node at `height` spans.
fn nodes_for_height(bit_width: u32, height: u32) -> u64 {
    let height_log_two = bit_width as u64 * height as u64;
    if height_log_two >= 64 {
        return u64::MAX;
    }
    1 << height_log_two
}

fn init_sized_vec<V>(bit_width: u32) -> Vec<Option<V>> {
    std::iter::repeat_with(|| None)
        .take(1 << bit_width)
        .collect()
}

fn bmap_bytes(bit_width: u32) -> usize {
    if bit_width <= 3 {
        1
    } else {
        1 << (bit_width - 3)
    }
}

#[cfg(test)]
mod tests {
    mod amt_tests;
}
