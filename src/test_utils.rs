// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;

use crate::blocks::{BlockHeader, TipsetKey};
use crate::utils::cid::CidCborExt;

/// Header with deterministic filler content, enough for chain plumbing
/// tests that never validate consensus fields.
pub fn dummy_header(epoch: ChainEpoch, parents: Vec<Cid>) -> BlockHeader {
    dummy_header_on_state(
        epoch,
        parents,
        Cid::from_cbor_blake2b256(&format!("state@{epoch}")).unwrap(),
    )
}

pub fn dummy_header_on_state(
    epoch: ChainEpoch,
    parents: Vec<Cid>,
    state_root: Cid,
) -> BlockHeader {
    BlockHeader {
        miner: Address::new_id(1000),
        parents: TipsetKey::new(parents),
        parent_weight: BigInt::from(epoch) * 100,
        epoch,
        parent_state_root: state_root,
        parent_message_receipts: Cid::from_cbor_blake2b256(&"receipts").unwrap(),
        messages: Cid::from_cbor_blake2b256(&"messages").unwrap(),
        timestamp: 1_700_000_000 + epoch as u64 * 30,
        parent_base_fee: TokenAmount::from_atto(100),
    }
}
