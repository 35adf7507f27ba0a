// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::{multihash::Multihash, Cid, Version};
use multihash_codetable::{Code::Blake2b256, MultihashDigest};
use fvm_ipld_encoding::DAG_CBOR;

/// Digest size of BLAKE2b-256, the hash function behind every internal CID.
pub const BLAKE2B256_SIZE: usize = 32;

/// Multicodec code of BLAKE2b-256.
pub const BLAKE2B256_CODE: u64 = 0xb220;

/// Binary prefix of a CIDv1 `dag-cbor` BLAKE2b-256 CID: version, codec,
/// hash code varint and digest length. Concatenating this with a 32-byte
/// digest yields the full CID bytes.
pub const CBOR_BLAKE2B256_PREFIX: [u8; 6] = [0x01, 0x71, 0xA0, 0xE4, 0x02, 0x20];

/// Extension methods for constructing `dag-cbor` [`Cid`]
pub trait CidCborExt {
    /// Default CID builder for Filecoin objects: `dag-cbor` + 256-bit
    /// BLAKE2b.
    fn from_cbor_blake2b256<S: serde::ser::Serialize>(obj: &S) -> anyhow::Result<Cid> {
        let bytes = fvm_ipld_encoding::to_vec(obj)?;
        Ok(Cid::new_v1(DAG_CBOR, Blake2b256.digest(&bytes)))
    }
}

impl CidCborExt for Cid {}

/// The overwhelming majority of CIDs in a working repository are
/// `V1`/`dag-cbor`/BLAKE2b-256. Splitting those out lets sets and index
/// rows store the bare 32-byte digest instead of a full [`Cid`].
pub enum CidVariant {
    V1DagCborBlake2b([u8; BLAKE2B256_SIZE]),
}

impl TryFrom<Cid> for CidVariant {
    type Error = ();

    fn try_from(cid: Cid) -> Result<Self, Self::Error> {
        if let Some(digest) = blake2b_digest(&cid) {
            if cid.version() == Version::V1 && cid.codec() == DAG_CBOR {
                return Ok(CidVariant::V1DagCborBlake2b(digest));
            }
        }
        Err(())
    }
}

/// Returns the bare BLAKE2b-256 digest of `cid`, or `None` when the CID
/// uses a different hash function or digest length.
pub fn blake2b_digest(cid: &Cid) -> Option<[u8; BLAKE2B256_SIZE]> {
    let hash = cid.hash();
    if hash.code() != BLAKE2B256_CODE || hash.size() as usize != BLAKE2B256_SIZE {
        return None;
    }
    hash.digest().try_into().ok()
}

/// Reconstructs the canonical `dag-cbor` CID from a bare BLAKE2b-256
/// digest, the inverse of [`blake2b_digest`] for internal objects.
pub fn cbor_blake2b_cid(digest: &[u8; BLAKE2B256_SIZE]) -> Cid {
    let mh = Multihash::wrap(BLAKE2B256_CODE, digest).expect("digest length checked by type");
    Cid::new_v1(DAG_CBOR, mh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_constructed_cid() {
        let digest = crate::utils::encoding::blake2b_256(b"prefix check");
        let cid = cbor_blake2b_cid(&digest);
        let bytes = cid.to_bytes();
        assert_eq!(&bytes[..6], &CBOR_BLAKE2B256_PREFIX);
        assert_eq!(&bytes[6..], &digest);
        assert_eq!(blake2b_digest(&cid), Some(digest));
    }

    #[test]
    fn digest_rejects_other_hashes() {
        let cid = Cid::new_v1(
            fvm_ipld_encoding::IPLD_RAW,
            multihash_codetable::Code::Sha2_256.digest(b"other"),
        );
        assert!(blake2b_digest(&cid).is_none());
    }
}
