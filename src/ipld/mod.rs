// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Streaming reachability traversal over the content-addressed DAG.
//!
//! The DAG is acyclic by construction (a block's CID is the hash of its
//! bytes), so a depth-first walk with a visited set terminates and visits
//! every reachable block exactly once. The walker drives the buffered
//! writer's flush, snapshot export and archive compaction.

mod cid_hashset;

pub use cid_hashset::CidHashSet;

use anyhow::anyhow;
use multihash_codetable::Code;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{from_slice, DAG_CBOR};

use crate::utils::encoding::CidVec;

/// Extracts the CIDs referenced by a `dag-cbor` block, in encounter order.
pub fn scan_links(data: &[u8]) -> anyhow::Result<Vec<Cid>> {
    Ok(from_slice::<CidVec>(data)?.into())
}

/// Inline (identity-hashed) CIDs carry their payload in the CID itself and
/// are never stored or traversed. Only `dag-cbor` blocks are parsed for
/// further links; `raw` blocks are leaves.
pub fn is_stored_block(cid: &Cid) -> bool {
    cid.hash().code() != u64::from(Code::Identity)
}

/// Walks every block reachable from `roots`, calling `on_block` once per
/// unique CID with the block's bytes. Returns the number of blocks
/// visited. A reachable block missing from `store` is an error.
pub fn walk_reachable<DB, F>(
    store: &DB,
    roots: impl IntoIterator<Item = Cid>,
    mut on_block: F,
) -> anyhow::Result<usize>
where
    DB: Blockstore,
    F: FnMut(&Cid, &[u8]) -> anyhow::Result<()>,
{
    let mut seen = CidHashSet::default();
    let mut stack: Vec<Cid> = roots.into_iter().collect();
    let mut visited = 0;
    while let Some(next) = stack.pop() {
        if !seen.insert(next) || !is_stored_block(&next) {
            continue;
        }
        let data = store
            .get(&next)?
            .ok_or_else(|| anyhow!("block {next} is reachable but not in the store"))?;
        on_block(&next, &data)?;
        visited += 1;
        if next.codec() == DAG_CBOR {
            stack.extend(scan_links(&data)?);
        }
    }
    Ok(visited)
}
