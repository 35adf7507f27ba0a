// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::serde::BytesToCidVisitor;
use cid::Cid;
use core::fmt;
use serde::de::{self, DeserializeSeed, SeqAccess, Visitor};
use serde::Deserializer;
use std::ops::Deref;

/// Collects every CID embedded in a `dag-cbor` document without
/// materializing the document itself. Deserializing a block into `CidVec`
/// is how the tree walker discovers outgoing links: CIDs are the only
/// values a `dag-cbor` deserializer surfaces as newtype structs, so the
/// visitor records those and discards every other scalar.
#[derive(Default)]
pub struct CidVec(Vec<Cid>);

impl Deref for CidVec {
    type Target = Vec<Cid>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<CidVec> for Vec<Cid> {
    fn from(v: CidVec) -> Self {
        v.0
    }
}

/// Seed that appends encountered CIDs to a shared vector while recursing
/// through maps and lists.
struct CollectCids<'a>(&'a mut Vec<Cid>);

impl<'de> DeserializeSeed<'de> for CollectCids<'_> {
    type Value = ();

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CidVisitor<'a>(&'a mut Vec<Cid>);

        impl<'de> Visitor<'de> for CidVisitor<'_> {
            type Value = ();

            fn expecting(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt.write_str("any valid IPLD kind")
            }

            fn visit_str<E: de::Error>(self, _: &str) -> Result<(), E> {
                Ok(())
            }

            fn visit_bytes<E: de::Error>(self, _: &[u8]) -> Result<(), E> {
                Ok(())
            }

            fn visit_byte_buf<E: de::Error>(self, _: Vec<u8>) -> Result<(), E> {
                Ok(())
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<(), E> {
                Ok(())
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> Result<(), E> {
                Ok(())
            }

            fn visit_i128<E: de::Error>(self, _: i128) -> Result<(), E> {
                Ok(())
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<(), E> {
                Ok(())
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<(), E> {
                Ok(())
            }

            fn visit_unit<E: de::Error>(self) -> Result<(), E> {
                Ok(())
            }

            fn visit_none<E: de::Error>(self) -> Result<(), E> {
                Ok(())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
            where
                A: SeqAccess<'de>,
            {
                while seq.next_element_seed(CollectCids(self.0))?.is_some() {}
                Ok(())
            }

            fn visit_map<A>(self, mut map: A) -> Result<(), A::Error>
            where
                A: de::MapAccess<'de>,
            {
                // Map keys cannot be links in `dag-cbor`; recurse into values.
                while map
                    .next_entry_seed(CollectCids(&mut Vec::new()), CollectCids(self.0))?
                    .is_some()
                {}
                Ok(())
            }

            /// Newtype structs are only ever used to surface CIDs.
            fn visit_newtype_struct<D>(self, deserializer: D) -> Result<(), D::Error>
            where
                D: de::Deserializer<'de>,
            {
                let cid = deserializer.deserialize_bytes(BytesToCidVisitor)?;
                self.0.push(cid);
                Ok(())
            }
        }

        deserializer.deserialize_any(CidVisitor(self.0))
    }
}

impl<'de> de::Deserialize<'de> for CidVec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let mut links = Vec::new();
        CollectCids(&mut links).deserialize(deserializer)?;
        Ok(CidVec(links))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cid::CidCborExt;
    use fvm_ipld_encoding::from_slice;

    #[test]
    fn extracts_nested_links() {
        let a = Cid::from_cbor_blake2b256(&"a").unwrap();
        let b = Cid::from_cbor_blake2b256(&"b").unwrap();
        let doc = fvm_ipld_encoding::to_vec(&(1u64, vec![a], (b, "text".to_string()))).unwrap();
        let links = from_slice::<CidVec>(&doc).unwrap();
        assert_eq!(links.as_slice(), &[a, b]);
    }

    #[test]
    fn scalar_documents_have_no_links() {
        let doc = fvm_ipld_encoding::to_vec(&(42u64, "str", vec![0xffu8])).unwrap();
        let links = from_slice::<CidVec>(&doc).unwrap();
        assert!(links.is_empty());
    }
}
