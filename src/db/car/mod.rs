// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! CAR-backed persistent block store.
//!
//! A CAR file is an append-only stream of `uvarint(len) || cid || payload`
//! frames behind a `dag-cbor` header carrying the root CIDs. Alongside it
//! lives a sorted side index ([`index`]) giving random reads. New blocks
//! are appended to the archive and tracked in an in-memory written set; a
//! coalesced flush merges the written rows with the on-disk index and
//! swaps it atomically via rename.

pub mod index;

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{from_slice, to_vec};
use integer_encoding::{VarIntReader, VarIntWriter};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use self::index::{max_size, CarIndex, CarIndexBuilder, Key, Row};
use crate::ipld::walk_reachable;
use crate::utils::cid::blake2b_digest;

/// Number of written rows that triggers an index merge.
const WRITTEN_FLUSH_THRESHOLD: usize = 4096;

#[derive(Debug, Error)]
pub enum CarError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Malformed external input (snapshot import), recoverable rejection.
    #[error("invalid car file: {0}")]
    InvalidFile(String),
    #[error("invalid index file: {0}")]
    InvalidIndex(String),
    /// Trusted local storage contradicts its index. Treated as fatal by
    /// callers; the store never silently repairs.
    #[error("inconsistent archive: {0}")]
    Inconsistent(String),
    #[error("archive is not writable")]
    NotWritable,
    #[error("archive exceeds the 40-bit offset range")]
    OffsetOverflow,
}

/// CARv1 header frame.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct CarHeader {
    pub roots: Vec<Cid>,
    pub version: u64,
}

struct AppendHandle {
    file: File,
    offset: u64,
}

/// Block store over a CAR archive and its side index.
///
/// Readers share the file behind a mutex for seek+read; the index is
/// swapped under its own lock only for the pointer exchange, so lookups
/// run against a stable snapshot; the written set takes a shared lock for
/// lookups and a unique lock for inserts.
pub struct CarStore {
    car_path: PathBuf,
    index_path: PathBuf,
    car_file: Mutex<File>,
    writable: Option<Mutex<AppendHandle>>,
    index: RwLock<Arc<CarIndex>>,
    written: RwLock<BTreeSet<Row>>,
    flushing: AtomicBool,
    roots: Vec<Cid>,
}

impl CarStore {
    /// Opens an existing archive read-only, building the side index on
    /// first use.
    pub fn open(
        car_path: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
    ) -> Result<Self, CarError> {
        Self::open_inner(car_path.into(), index_path.into(), false)
    }

    /// Opens an archive for appending.
    pub fn open_writable(
        car_path: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
    ) -> Result<Self, CarError> {
        Self::open_inner(car_path.into(), index_path.into(), true)
    }

    /// Creates a fresh archive holding only a header with `roots`, then
    /// opens it for appending.
    pub fn create(
        car_path: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
        roots: Vec<Cid>,
    ) -> Result<Self, CarError> {
        let car_path = car_path.into();
        let mut file = File::create(&car_path)?;
        let header = to_vec(&CarHeader { roots, version: 1 })
            .map_err(|e| CarError::InvalidFile(e.to_string()))?;
        file.write_varint(header.len())?;
        file.write_all(&header)?;
        file.sync_all()?;
        Self::open_inner(car_path, index_path.into(), true)
    }

    fn open_inner(
        car_path: PathBuf,
        index_path: PathBuf,
        writable: bool,
    ) -> Result<Self, CarError> {
        let mut car_file = File::open(&car_path)?;

        let header_len = index::builder::read_frame_length(&mut car_file)?
            .ok_or_else(|| CarError::InvalidFile("empty car file".into()))?;
        let mut header_bytes = vec![0u8; header_len as usize];
        car_file.read_exact(&mut header_bytes)?;
        let header: CarHeader = from_slice(&header_bytes)
            .map_err(|e| CarError::InvalidFile(format!("bad header: {e}")))?;
        if header.version != 1 {
            return Err(CarError::InvalidFile(format!(
                "unsupported car version {}",
                header.version
            )));
        }

        if !index_path.exists() {
            let indexed = index::builder::create(&car_path, &index_path)?;
            debug!(?index_path, indexed, "created missing car index");
        }
        let index = CarIndex::load(&index_path)?;

        let writable = if writable {
            let file = OpenOptions::new().append(true).open(&car_path)?;
            let offset = file.metadata()?.len();
            Some(Mutex::new(AppendHandle { file, offset }))
        } else {
            None
        };

        Ok(CarStore {
            car_path,
            index_path,
            car_file: Mutex::new(car_file),
            writable,
            index: RwLock::new(Arc::new(index)),
            written: RwLock::new(BTreeSet::new()),
            flushing: AtomicBool::new(false),
            roots: header.roots,
        })
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    pub fn car_path(&self) -> &Path {
        &self.car_path
    }

    fn find_written(&self, key: &Key) -> Option<Row> {
        let written = self.written.read();
        let probe = Row {
            key: *key,
            offset: 0,
            max_size64: 0,
        };
        written
            .range(probe..)
            .next()
            .filter(|row| &row.key == key)
            .copied()
    }

    fn find(&self, key: &Key) -> Option<Row> {
        let index = self.index.read().clone();
        index.find(key).or_else(|| self.find_written(key))
    }

    /// Seeks to a row's frame and returns the payload, verifying the
    /// frame's CID digest against the row key.
    fn read_row(&self, row: &Row) -> anyhow::Result<Vec<u8>> {
        let mut file = self.car_file.lock();
        file.seek(SeekFrom::Start(row.offset))?;
        let body_len: u64 = file.read_varint()?;
        if body_len == 0 || body_len > max_size(row.max_size64) {
            error!(offset = row.offset, body_len, "car read inconsistent");
            return Err(CarError::Inconsistent(format!(
                "frame at {} larger than its index row",
                row.offset
            ))
            .into());
        }
        let mut body = vec![0u8; body_len as usize];
        file.read_exact(&mut body)
            .map_err(|_| CarError::Inconsistent(format!("truncated frame at {}", row.offset)))?;
        drop(file);

        let mut cursor = std::io::Cursor::new(&body);
        let cid = Cid::read_bytes(&mut cursor)
            .map_err(|e| CarError::Inconsistent(format!("bad frame cid: {e}")))?;
        if blake2b_digest(&cid) != Some(row.key) {
            error!(offset = row.offset, "car frame does not match index key");
            return Err(
                CarError::Inconsistent(format!("frame at {} has a foreign cid", row.offset)).into(),
            );
        }
        Ok(body.split_off(cursor.position() as usize))
    }

    /// Merges the written set into the on-disk index and swaps it in.
    /// Concurrent calls coalesce: whoever loses the flag race returns
    /// immediately.
    pub fn flush_written(&self) -> Result<(), CarError> {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.do_flush();
        self.flushing.store(false, Ordering::Release);
        result
    }

    fn do_flush(&self) -> Result<(), CarError> {
        let (rows, max_offset) = {
            let written = self.written.read();
            let max_offset = written.iter().map(|r| r.offset).max().unwrap_or(0);
            (written.iter().copied().collect_vec(), max_offset)
        };
        if rows.is_empty() {
            return Ok(());
        }

        let merged: Vec<Row> = {
            let index = self.index.read().clone();
            index
                .rows()
                .iter()
                .copied()
                .merge(rows)
                .dedup_by(|a, b| a.key == b.key)
                .collect()
        };
        let builder = CarIndexBuilder::new(merged);
        builder.write_atomic(&self.index_path)?;
        let new_index = CarIndex::load(&self.index_path)?;

        {
            let mut index = self.index.write();
            *index = Arc::new(new_index);
        }

        let mut written = self.written.write();
        written.retain(|row| row.offset > max_offset);
        debug!(index = builder.len(), "merged car index");
        Ok(())
    }

    fn append(&self, key: Key, cid: &Cid, data: &[u8]) -> anyhow::Result<()> {
        let Some(writable) = &self.writable else {
            return Err(CarError::NotWritable.into());
        };
        let mut handle = writable.lock();
        if self.find_written(&key).is_some() {
            return Ok(());
        }

        let cid_bytes = cid.to_bytes();
        let body_len = cid_bytes.len() + data.len();
        let mut frame = Vec::with_capacity(body_len + 4);
        frame.write_varint(body_len)?;
        frame.extend_from_slice(&cid_bytes);
        frame.extend_from_slice(data);

        if handle.offset + frame.len() as u64 >= 1 << 40 {
            return Err(CarError::OffsetOverflow.into());
        }

        handle.file.write_all(&frame)?;
        handle.file.flush()?;
        let row = Row::new(key, handle.offset, frame.len() as u64);
        handle.offset += frame.len() as u64;

        let pending = {
            let mut written = self.written.write();
            written.insert(row);
            written.len()
        };
        drop(handle);

        if pending >= WRITTEN_FLUSH_THRESHOLD {
            self.flush_written()?;
        }
        Ok(())
    }
}

impl Blockstore for CarStore {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(key) = blake2b_digest(k) else {
            return Ok(None);
        };
        match self.find(&key) {
            Some(row) => Ok(Some(self.read_row(&row)?)),
            None => Ok(None),
        }
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        Ok(blake2b_digest(k).map_or(false, |key| self.find(&key).is_some()))
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        let Some(key) = blake2b_digest(k) else {
            // Inline CIDs carry their payload; nothing to archive.
            anyhow::ensure!(
                k.hash().code() == 0,
                "only blake2b-256 and identity cids can be archived, got {k}"
            );
            return Ok(());
        };
        if self.find(&key).is_some() {
            return Ok(());
        }
        self.append(key, k, block)
    }
}

/// Writes a CARv1 snapshot of everything reachable from `roots` into
/// `writer`. Returns the number of exported blocks.
pub fn export_car<DB: Blockstore>(
    store: &DB,
    roots: &[Cid],
    writer: &mut impl Write,
) -> anyhow::Result<usize> {
    let header = to_vec(&CarHeader {
        roots: roots.to_vec(),
        version: 1,
    })?;
    writer.write_varint(header.len())?;
    writer.write_all(&header)?;

    let count = walk_reachable(store, roots.iter().copied(), |cid, data| {
        let cid_bytes = cid.to_bytes();
        writer.write_varint(cid_bytes.len() + data.len())?;
        writer.write_all(&cid_bytes)?;
        writer.write_all(data)?;
        Ok(())
    })?;
    Ok(count)
}

/// Compaction: copies the closure of `roots` out of `store` into a fresh
/// archive + index pair and opens the result. The old archive is left for
/// the operator to delete; blocks are never removed in place.
pub fn compact<DB: Blockstore>(
    store: &DB,
    roots: &[Cid],
    car_path: impl Into<PathBuf>,
    index_path: impl Into<PathBuf>,
) -> anyhow::Result<CarStore> {
    let car_path = car_path.into();
    let index_path = index_path.into();
    let mut writer = std::io::BufWriter::new(File::create(&car_path)?);
    let count = export_car(store, roots, &mut writer)?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    debug!(?car_path, count, "compacted archive");

    index::builder::create(&car_path, &index_path).context("indexing compacted archive")?;
    Ok(CarStore::open_writable(car_path, index_path)?)
}

#[cfg(test)]
mod tests;
