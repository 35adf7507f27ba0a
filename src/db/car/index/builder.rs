// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use cid::Cid;
use integer_encoding::VarIntReader;
use tracing::{debug, warn};

use super::Row;
use crate::db::car::CarError;
use crate::utils::cid::blake2b_digest;

/// Builds a sorted side index from scratch: one row per block frame,
/// sorted in memory, written next to the archive and renamed into place.
#[derive(Debug)]
pub struct CarIndexBuilder {
    rows: Vec<Row>,
}

impl CarIndexBuilder {
    pub fn new(rows: impl IntoIterator<Item = Row>) -> Self {
        let mut rows: Vec<Row> = rows.into_iter().collect();
        rows.sort_unstable();
        CarIndexBuilder { rows }
    }

    /// Scans a CAR stream sequentially and emits one row per block whose
    /// CID carries a BLAKE2b-256 digest. Malformed frames reject the file;
    /// snapshots come from outside the trust boundary.
    pub fn scan_car(reader: &mut (impl Read + Seek)) -> Result<Vec<Row>, CarError> {
        reader.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(reader);

        // Skip the header frame.
        let header_len = read_frame_length(&mut reader)?
            .ok_or_else(|| CarError::InvalidFile("empty car file".into()))?;
        std::io::copy(&mut (&mut reader).take(header_len), &mut std::io::sink())?;

        let mut rows = Vec::new();
        let mut skipped = 0usize;
        loop {
            let frame_offset = reader.stream_position()?;
            let Some(body_len) = read_frame_length(&mut reader)? else {
                break;
            };
            let body_offset = reader.stream_position()?;
            let frame_size = body_offset - frame_offset + body_len;

            let mut body = (&mut reader).take(body_len);
            let cid = Cid::read_bytes(&mut body)
                .map_err(|e| CarError::InvalidFile(format!("bad frame cid: {e}")))?;
            match blake2b_digest(&cid) {
                Some(key) => rows.push(Row::new(key, frame_offset, frame_size)),
                None => skipped += 1,
            }
            // Skip the payload.
            std::io::copy(&mut body, &mut std::io::sink())?;
            if reader.stream_position()? != body_offset + body_len {
                return Err(CarError::InvalidFile("truncated frame".into()));
            }
        }
        if skipped > 0 {
            warn!(skipped, "car blocks without blake2b digests are not indexed");
        }
        debug!(rows = rows.len(), "scanned car file");
        Ok(rows)
    }

    /// Writes sentinels and rows to `writer`.
    pub fn write(&self, mut writer: impl Write) -> std::io::Result<()> {
        writer.write_all(&Row::HEADER_V0.to_bytes())?;
        for row in &self.rows {
            writer.write_all(&row.to_bytes())?;
        }
        writer.write_all(&Row::TRAILER_V0.to_bytes())?;
        writer.flush()
    }

    /// Writes to `<path>.tmp` and renames into place, so concurrent
    /// readers see either the old index or the new one, never a torn file.
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        self.write(&mut writer)?;
        writer.into_inner()?.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Reads the uvarint length opening a frame, or `None` at a clean EOF.
pub(in crate::db::car) fn read_frame_length(
    reader: &mut impl Read,
) -> Result<Option<u64>, CarError> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte)? {
        0 => Ok(None),
        _ => {
            let len = byte
                .chain(reader)
                .read_varint::<u64>()
                .map_err(|e| CarError::InvalidFile(format!("bad frame length: {e}")))?;
            Ok(Some(len))
        }
    }
}

/// Scans `car_path` and writes the index at `index_path`, atomically.
/// Returns the number of indexed blocks.
pub fn create(
    car_path: impl AsRef<Path>,
    index_path: impl AsRef<Path>,
) -> Result<usize, CarError> {
    let mut car = File::open(car_path)?;
    let rows = CarIndexBuilder::scan_car(&mut car)?;
    let builder = CarIndexBuilder::new(rows);
    builder.write_atomic(index_path)?;
    Ok(builder.len())
}
