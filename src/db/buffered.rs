// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::{HashMap, HashMapExt};
use anyhow::bail;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::DAG_CBOR;
use parking_lot::RwLock;
use tracing::debug;

use crate::ipld::{is_stored_block, scan_links, CidHashSet};

/// Write-back buffer over a backing store.
///
/// Every write lands in an in-memory map; reads see buffered writes first
/// (read-your-writes). [`BufferedBlockstore::flush`] promotes exactly the
/// blocks reachable from a root into the backing store, so the many small
/// intermediate objects a message produces never hit the durable layer,
/// and a partial failure cannot leave the backing store referencing
/// nonexistent blocks.
pub struct BufferedBlockstore<BS> {
    base: BS,
    write: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl<BS: Blockstore> BufferedBlockstore<BS> {
    pub fn new(base: BS) -> Self {
        Self {
            base,
            write: RwLock::new(HashMap::new()),
        }
    }

    pub fn into_inner(self) -> BS {
        self.base
    }

    pub fn base(&self) -> &BS {
        &self.base
    }

    /// Number of blocks currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.write.read().len()
    }

    /// Promotes every block reachable from `root` that only exists in the
    /// buffer into the backing store, then discards the buffer. A
    /// reachable block present in neither layer fails the flush; nothing
    /// is claimed durable in that case.
    pub fn flush(&self, root: &Cid) -> anyhow::Result<()> {
        let write = self.write.read();
        let mut seen = CidHashSet::default();
        let mut stack = vec![*root];
        let mut promoted = 0usize;

        while let Some(cid) = stack.pop() {
            if !seen.insert(cid) || !is_stored_block(&cid) {
                continue;
            }
            if let Some(data) = write.get(&cid) {
                self.base.put_keyed(&cid, data)?;
                promoted += 1;
                if cid.codec() == DAG_CBOR {
                    stack.extend(scan_links(data)?);
                }
            } else if !self.base.has(&cid)? {
                bail!("flush of {root}: reachable block {cid} is in neither buffer nor store");
            }
            // A block already in the backing store was flushed with its
            // whole closure; no need to descend.
        }
        drop(write);

        let buffered = {
            let mut write = self.write.write();
            let total = write.len();
            write.clear();
            total
        };
        debug!(promoted, dropped = buffered - promoted, "flushed write buffer");
        Ok(())
    }
}

impl<BS: Blockstore> Blockstore for BufferedBlockstore<BS> {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(v) = self.write.read().get(k) {
            return Ok(Some(v.clone()));
        }
        self.base.get(k)
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        self.write.write().insert(*k, block.to_vec());
        Ok(())
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        Ok(self.write.read().contains_key(k) || self.base.has(k)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDB;
    use multihash_codetable::Code;
    use fvm_ipld_encoding::CborStore;

    #[test]
    fn reads_see_buffered_writes() {
        let base = MemoryDB::default();
        let buf = BufferedBlockstore::new(&base);
        let cid = buf.put_cbor(&"buffered", Code::Blake2b256).unwrap();
        assert!(buf.has(&cid).unwrap());
        assert_eq!(
            buf.get_cbor::<String>(&cid).unwrap().as_deref(),
            Some("buffered")
        );
        // Not yet durable.
        assert!(!base.has(&cid).unwrap());
    }

    #[test]
    fn flush_promotes_only_reachable_blocks() {
        let base = MemoryDB::default();
        let buf = BufferedBlockstore::new(&base);

        let leaf = buf.put_cbor(&0xaau64, Code::Blake2b256).unwrap();
        let root = buf.put_cbor(&(1u64, leaf), Code::Blake2b256).unwrap();
        let stray = buf.put_cbor(&"unreachable", Code::Blake2b256).unwrap();

        buf.flush(&root).unwrap();

        assert!(base.has(&root).unwrap());
        assert!(base.has(&leaf).unwrap());
        assert!(!base.has(&stray).unwrap());
        assert_eq!(buf.buffered_len(), 0);
    }

    #[test]
    fn flush_accepts_links_to_durable_blocks() {
        let base = MemoryDB::default();
        let durable = base.put_cbor(&"already there", Code::Blake2b256).unwrap();

        let buf = BufferedBlockstore::new(&base);
        let root = buf.put_cbor(&(durable, 2u64), Code::Blake2b256).unwrap();
        buf.flush(&root).unwrap();
        assert!(base.has(&root).unwrap());
    }

    #[test]
    fn flush_fails_on_dangling_reference() {
        let base = MemoryDB::default();
        let buf = BufferedBlockstore::new(&base);

        let hole = {
            let other = MemoryDB::default();
            other.put_cbor(&"never stored here", Code::Blake2b256).unwrap()
        };
        let root = buf.put_cbor(&(hole, 3u64), Code::Blake2b256).unwrap();

        assert!(buf.flush(&root).is_err());
        // No durability claim for the root.
        assert!(!base.has(&root).unwrap());
    }
}
