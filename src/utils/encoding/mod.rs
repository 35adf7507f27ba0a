// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod cid_de_cbor;

pub use cid_de_cbor::CidVec;

use multihash_codetable::{Code::Blake2b256, MultihashDigest};

use crate::utils::cid::BLAKE2B256_SIZE;

/// Hashes input into a 256-bit BLAKE2b digest.
pub fn blake2b_256(data: &[u8]) -> [u8; BLAKE2B256_SIZE] {
    Blake2b256
        .digest(data)
        .digest()
        .try_into()
        .expect("fixed digest size")
}
