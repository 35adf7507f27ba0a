// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::bigint::{bigint_ser, BigInt};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;

use super::TipsetKey;
use crate::utils::cid::CidCborExt;

/// Chain block header, `dag-cbor` tuple-encoded. Carries the fields the
/// state engine consumes; consensus artifacts (tickets, proofs,
/// signatures) live with the validation layer.
#[derive(Debug, Clone, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct BlockHeader {
    /// Address of the miner that mined this block.
    pub miner: Address,
    /// Tipset this block was mined on.
    pub parents: TipsetKey,
    /// Aggregate chain weight of the parent tipset.
    #[serde(with = "bigint_ser")]
    pub parent_weight: BigInt,
    /// Chain epoch of the block.
    pub epoch: ChainEpoch,
    /// State root after applying the parent tipset's messages.
    pub parent_state_root: Cid,
    /// Receipts root of the parent tipset's execution.
    pub parent_message_receipts: Cid,
    /// Root of the messages included in this block.
    pub messages: Cid,
    /// Unix timestamp the block was mined at.
    pub timestamp: u64,
    /// Base fee the parent tipset settles gas at.
    pub parent_base_fee: TokenAmount,
}

impl BlockHeader {
    /// CID of the serialized header. Header encoding is infallible, the
    /// fields are all plain `dag-cbor` values.
    pub fn cid(&self) -> Cid {
        Cid::from_cbor_blake2b256(self).expect("block header encoding cannot fail")
    }
}
