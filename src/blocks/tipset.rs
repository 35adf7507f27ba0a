// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};

use super::{BlockHeader, Error};

/// Canonical identity of a tipset: the sorted, deduplicated set of its
/// block CIDs. Serializes as a bare CID list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TipsetKey {
    cids: Vec<Cid>,
}

impl TipsetKey {
    pub fn new(mut cids: Vec<Cid>) -> Self {
        cids.sort_unstable();
        cids.dedup();
        TipsetKey { cids }
    }

    pub fn cids(&self) -> &[Cid] {
        &self.cids
    }

    pub fn is_empty(&self) -> bool {
        self.cids.is_empty()
    }
}

impl FromIterator<Cid> for TipsetKey {
    fn from_iter<I: IntoIterator<Item = Cid>>(iter: I) -> Self {
        TipsetKey::new(iter.into_iter().collect())
    }
}

/// Set of block headers mined on the same parents at the same height, the
/// unit of chain progress. All members agree on parents, epoch, parent
/// state and parent base fee; construction enforces it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tipset {
    headers: Vec<BlockHeader>,
}

impl Tipset {
    pub fn new(mut headers: Vec<BlockHeader>) -> Result<Self, Error> {
        let first = headers.first().ok_or(Error::EmptyTipset)?;

        for header in &headers[1..] {
            if header.epoch != first.epoch {
                return Err(Error::HeaderMismatch("epoch"));
            }
            if header.parents != first.parents {
                return Err(Error::HeaderMismatch("parents"));
            }
            if header.parent_state_root != first.parent_state_root {
                return Err(Error::HeaderMismatch("parent state root"));
            }
            if header.parent_weight != first.parent_weight {
                return Err(Error::HeaderMismatch("parent weight"));
            }
            if header.parent_base_fee != first.parent_base_fee {
                return Err(Error::HeaderMismatch("parent base fee"));
            }
        }

        // Canonical member order is CID order; duplicates collapse.
        headers.sort_by_cached_key(BlockHeader::cid);
        headers.dedup();
        Ok(Tipset { headers })
    }

    /// Tipset with a single block.
    pub fn from_header(header: BlockHeader) -> Self {
        Tipset {
            headers: vec![header],
        }
    }

    pub fn key(&self) -> TipsetKey {
        self.headers.iter().map(BlockHeader::cid).collect()
    }

    pub fn blocks(&self) -> &[BlockHeader] {
        &self.headers
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.headers[0].epoch
    }

    pub fn parents(&self) -> &TipsetKey {
        &self.headers[0].parents
    }

    pub fn parent_state(&self) -> &Cid {
        &self.headers[0].parent_state_root
    }

    pub fn parent_base_fee(&self) -> &TokenAmount {
        &self.headers[0].parent_base_fee
    }

    pub fn parent_weight(&self) -> &BigInt {
        &self.headers[0].parent_weight
    }

    pub fn min_timestamp(&self) -> u64 {
        self.headers
            .iter()
            .map(|h| h.timestamp)
            .min()
            .expect("tipsets are non-empty")
    }

    /// Tipsets are never empty; `len` is at least 1.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.headers.len()
    }
}
