// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Tipset resolution and the chain-level durable records.
//!
//! A [`TipsetLoader`] materializes tipsets from their keys by reading
//! headers out of the block store, behind an LRU cache of weak handles:
//! live tipsets are shared, dead ones are reloaded on demand, and memory
//! pressure elsewhere reclaims cache entries without explicit eviction.

use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use anyhow::Context as _;
use cid::Cid;
use fvm_ipld_encoding::{from_slice, to_vec, CborStore};
use lru::LruCache;
use parking_lot::Mutex;

use fvm_ipld_blockstore::Blockstore;

use crate::blocks::{BlockHeader, Tipset, TipsetKey};
use crate::db::{setting_keys, SettingsStore};

/// Default number of resolved tipsets kept in the loader cache.
const DEFAULT_TIPSET_CACHE_SIZE: usize = 8192;

/// Resolves tipset keys to materialized tipsets through the block store.
pub struct TipsetLoader<DB> {
    db: DB,
    cache: Mutex<LruCache<TipsetKey, Weak<Tipset>>>,
}

impl<DB: Blockstore> TipsetLoader<DB> {
    pub fn new(db: DB) -> Self {
        Self::with_capacity(db, DEFAULT_TIPSET_CACHE_SIZE)
    }

    pub fn with_capacity(db: DB, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("clamped to at least 1");
        TipsetLoader {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Resolves `key`, serving live cache entries without touching the
    /// store.
    pub fn load(&self, key: &TipsetKey) -> anyhow::Result<Arc<Tipset>> {
        if let Some(ts) = self.cache.lock().get(key).and_then(Weak::upgrade) {
            return Ok(ts);
        }
        let tipset = Arc::new(self.load_uncached(key)?);
        self.cache
            .lock()
            .put(key.clone(), Arc::downgrade(&tipset));
        Ok(tipset)
    }

    /// Promotes a live weak handle, or re-resolves `key` and re-arms the
    /// handle when it expired.
    pub fn load_weak(&self, weak: &mut Weak<Tipset>, key: &TipsetKey) -> anyhow::Result<Arc<Tipset>> {
        if let Some(ts) = weak.upgrade() {
            return Ok(ts);
        }
        let tipset = self.load(key)?;
        *weak = Arc::downgrade(&tipset);
        Ok(tipset)
    }

    fn load_uncached(&self, key: &TipsetKey) -> anyhow::Result<Tipset> {
        let mut headers = Vec::with_capacity(key.cids().len());
        for cid in key.cids() {
            let header: BlockHeader = self
                .db
                .get_cbor(cid)?
                .with_context(|| format!("block header {cid} not found"))?;
            headers.push(header);
        }
        Ok(Tipset::new(headers)?)
    }
}

/// Chain store: the tipset loader plus the small durable records a
/// working repository keeps outside the archive (genesis CID, chain
/// head).
pub struct ChainStore<DB> {
    db: Arc<DB>,
    loader: TipsetLoader<Arc<DB>>,
}

impl<DB> ChainStore<DB>
where
    DB: Blockstore + SettingsStore,
{
    pub fn new(db: Arc<DB>) -> Self {
        let loader = TipsetLoader::new(db.clone());
        ChainStore { db, loader }
    }

    pub fn blockstore(&self) -> &DB {
        &self.db
    }

    pub fn loader(&self) -> &TipsetLoader<Arc<DB>> {
        &self.loader
    }

    pub fn set_genesis(&self, header: &BlockHeader) -> anyhow::Result<Cid> {
        let cid = self.db.put_cbor(header, cid::multihash::Code::Blake2b256)?;
        self.db
            .write_bin(setting_keys::GENESIS_KEY, &to_vec(&cid)?)?;
        Ok(cid)
    }

    pub fn genesis(&self) -> anyhow::Result<Option<Cid>> {
        self.db
            .read_bin(setting_keys::GENESIS_KEY)?
            .map(|bytes| from_slice(&bytes).map_err(Into::into))
            .transpose()
    }

    /// Persists the tipset's headers and records it as the chain head.
    pub fn set_head(&self, tipset: &Tipset) -> anyhow::Result<()> {
        for header in tipset.blocks() {
            self.db.put_cbor(header, cid::multihash::Code::Blake2b256)?;
        }
        self.db
            .write_bin(setting_keys::HEAD_KEY, &to_vec(&tipset.key())?)?;
        Ok(())
    }

    pub fn heaviest_tipset(&self) -> anyhow::Result<Option<Arc<Tipset>>> {
        let Some(bytes) = self.db.read_bin(setting_keys::HEAD_KEY)? else {
            return Ok(None);
        };
        let key: TipsetKey = from_slice(&bytes)?;
        Ok(Some(self.loader.load(&key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDB;
    use crate::test_utils::dummy_header;

    fn store_headers(db: &MemoryDB, headers: &[BlockHeader]) -> TipsetKey {
        headers
            .iter()
            .map(|h| db.put_cbor(h, cid::multihash::Code::Blake2b256).unwrap())
            .collect()
    }

    #[test]
    fn load_resolves_and_caches() {
        let db = Arc::new(MemoryDB::default());
        let loader = TipsetLoader::new(db.clone());

        let header = dummy_header(3, vec![]);
        let key = store_headers(&db, std::slice::from_ref(&header));

        let first = loader.load(&key).unwrap();
        assert_eq!(first.epoch(), 3);
        let second = loader.load(&key).unwrap();
        // Same allocation while a strong handle is live.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn weak_entries_reload_after_drop() {
        let db = Arc::new(MemoryDB::default());
        let loader = TipsetLoader::new(db.clone());
        let header = dummy_header(4, vec![]);
        let key = store_headers(&db, std::slice::from_ref(&header));

        let mut weak = Weak::new();
        let ts = loader.load_weak(&mut weak, &key).unwrap();
        assert_eq!(ts.epoch(), 4);
        assert!(weak.upgrade().is_some());

        drop(ts);
        assert!(weak.upgrade().is_none());
        // Expired handle re-resolves and is re-armed.
        let ts = loader.load_weak(&mut weak, &key).unwrap();
        assert_eq!(ts.epoch(), 4);
        assert!(weak.upgrade().is_some());
    }

    #[test]
    fn missing_header_is_an_error() {
        let db = Arc::new(MemoryDB::default());
        let loader = TipsetLoader::new(db);
        let key = TipsetKey::new(vec![dummy_header(1, vec![]).cid()]);
        assert!(loader.load(&key).is_err());
    }

    #[test]
    fn chain_store_tracks_genesis_and_head() {
        let db = Arc::new(MemoryDB::default());
        let chain = ChainStore::new(db.clone());
        assert!(chain.genesis().unwrap().is_none());
        assert!(chain.heaviest_tipset().unwrap().is_none());

        let genesis = dummy_header(0, vec![]);
        let genesis_cid = chain.set_genesis(&genesis).unwrap();
        assert_eq!(chain.genesis().unwrap(), Some(genesis_cid));

        let head = Tipset::new(vec![dummy_header(1, vec![genesis_cid])]).unwrap();
        chain.set_head(&head).unwrap();
        let loaded = chain.heaviest_tipset().unwrap().unwrap();
        assert_eq!(loaded.key(), head.key());
        assert_eq!(loaded.epoch(), 1);
    }
}
