// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_ipld_encoding::{strict_bytes, BytesSer};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// 256-bit occupancy bitmap of a node's child slots.
///
/// Serialized as a big-endian byte string with leading zero bytes
/// stripped, the canonical form shared by all implementations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Bitfield([u64; 4]);

impl Bitfield {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn test_bit(&self, bit: u32) -> bool {
        debug_assert!(bit < 256);
        self.0[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    pub fn set_bit(&mut self, bit: u32) {
        debug_assert!(bit < 256);
        self.0[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    pub fn clear_bit(&mut self, bit: u32) {
        debug_assert!(bit < 256);
        self.0[(bit / 64) as usize] &= !(1 << (bit % 64));
    }

    /// Bitfield with every bit strictly below `bit` set; `and`-ing it with
    /// the occupancy map counts the pointers stored before a slot.
    pub fn set_bits_le(mut self, bit: u32) -> Self {
        for i in 0..bit {
            self.set_bit(i);
        }
        self
    }

    pub fn and(&self, other: &Self) -> Self {
        Bitfield([
            self.0[0] & other.0[0],
            self.0[1] & other.0[1],
            self.0[2] & other.0[2],
            self.0[3] & other.0[3],
        ])
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|a| a.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().rev().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn from_be_slice(slice: &[u8]) -> Result<Self, &'static str> {
        if slice.len() > 32 {
            return Err("bitfield longer than 32 bytes");
        }
        let mut bytes = [0u8; 32];
        bytes[32 - slice.len()..].copy_from_slice(slice);
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let start = (3 - i) * 8;
            *word = u64::from_be_bytes(bytes[start..start + 8].try_into().expect("8-byte chunk"));
        }
        Ok(Bitfield(words))
    }
}

impl Serialize for Bitfield {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes = self.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        BytesSer(&bytes[first..]).serialize(s)
    }
}

impl<'de> Deserialize<'de> for Bitfield {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = strict_bytes::deserialize(deserializer)?;
        Bitfield::from_be_slice(&bytes).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_encoding::{from_slice, to_vec};

    #[test]
    fn minimal_bytes_round_trip() {
        let mut bf = Bitfield::zero();
        for bit in [0, 7, 63, 64, 130, 255] {
            bf.set_bit(bit);
            assert!(bf.test_bit(bit));
        }
        let bytes = to_vec(&bf).unwrap();
        assert_eq!(from_slice::<Bitfield>(&bytes).unwrap(), bf);

        bf.clear_bit(255);
        bf.clear_bit(130);
        bf.clear_bit(64);
        // Leading zeros must be stripped: highest set bit is now 63.
        let bytes = to_vec(&bf).unwrap();
        assert_eq!(bytes.len(), 1 + 8);
        assert_eq!(from_slice::<Bitfield>(&bytes).unwrap(), bf);
    }

    #[test]
    fn popcount_below_bit() {
        let mut bf = Bitfield::zero();
        bf.set_bit(1);
        bf.set_bit(5);
        bf.set_bit(100);
        let mask = Bitfield::zero().set_bits_le(100);
        assert_eq!(mask.count_ones(), 100);
        assert_eq!(mask.and(&bf).count_ones(), 2);
    }
}
