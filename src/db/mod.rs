// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub mod buffered;
pub mod car;
mod memory;

pub use memory::MemoryDB;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub mod setting_keys {
    /// Key used to store the heaviest tipset key in the settings store.
    pub const HEAD_KEY: &str = "head";
    /// Key used to store the genesis block CID in the settings store.
    pub const GENESIS_KEY: &str = "genesis";
    /// Estimated number of IPLD records in the database, a `usize`.
    pub const ESTIMATED_RECORDS_KEY: &str = "estimated_reachable_records";
}

/// Interface used to store and retrieve settings from the database:
/// genesis CID, chain head, counters. To store IPLD blocks, use the
/// [`fvm_ipld_blockstore::Blockstore`] trait.
pub trait SettingsStore {
    /// Reads a binary field from the settings store.
    fn read_bin(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    /// Writes a binary field to the settings store.
    fn write_bin(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;

    /// Returns `Ok(true)` if key exists in store.
    fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Returns all setting keys.
    fn setting_keys(&self) -> anyhow::Result<Vec<String>>;
}

impl<T: SettingsStore> SettingsStore for Arc<T> {
    fn read_bin(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        SettingsStore::read_bin(self.as_ref(), key)
    }

    fn write_bin(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        SettingsStore::write_bin(self.as_ref(), key, value)
    }

    fn exists(&self, key: &str) -> anyhow::Result<bool> {
        SettingsStore::exists(self.as_ref(), key)
    }

    fn setting_keys(&self) -> anyhow::Result<Vec<String>> {
        SettingsStore::setting_keys(self.as_ref())
    }
}

/// Extension trait for [`SettingsStore`], implemented for all its
/// implementors: reads and writes any serializable object.
pub trait SettingsStoreExt {
    fn read_obj<V: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<V>>;
    fn write_obj<V: Serialize>(&self, key: &str, value: &V) -> anyhow::Result<()>;

    /// Same as [`SettingsStoreExt::read_obj`], but errors if the key does
    /// not exist.
    fn require_obj<V: DeserializeOwned>(&self, key: &str) -> anyhow::Result<V>;
}

impl<T: ?Sized + SettingsStore> SettingsStoreExt for T {
    fn read_obj<V: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<V>> {
        match self.read_bin(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_obj<V: Serialize>(&self, key: &str, value: &V) -> anyhow::Result<()> {
        self.write_bin(key, &serde_json::to_vec(value)?)
    }

    fn require_obj<V: DeserializeOwned>(&self, key: &str) -> anyhow::Result<V> {
        self.read_bin(key)?
            .ok_or_else(|| anyhow::anyhow!("key {key} not found"))
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_objects() {
        let db = MemoryDB::default();
        db.write_obj(setting_keys::ESTIMATED_RECORDS_KEY, &42usize)
            .unwrap();
        assert!(db.exists(setting_keys::ESTIMATED_RECORDS_KEY).unwrap());
        assert_eq!(
            db.read_obj::<usize>(setting_keys::ESTIMATED_RECORDS_KEY)
                .unwrap(),
            Some(42)
        );
        assert!(db.read_obj::<usize>(setting_keys::HEAD_KEY).unwrap().is_none());
        assert!(db.require_obj::<usize>(setting_keys::HEAD_KEY).is_err());
        assert_eq!(
            db.setting_keys().unwrap(),
            vec![setting_keys::ESTIMATED_RECORDS_KEY.to_string()]
        );
    }
}
