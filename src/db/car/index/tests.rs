// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{CarIndex, CarIndexBuilder, Row};
use crate::utils::encoding::blake2b_256;

fn sample_rows(n: u64) -> Vec<Row> {
    (0..n)
        .map(|i| Row::new(blake2b_256(&i.to_be_bytes()), i * 100, 64 + i))
        .collect()
}

#[test]
fn write_load_find_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.car.idx");

    let rows = sample_rows(500);
    CarIndexBuilder::new(rows.clone()).write_atomic(&path).unwrap();

    let index = CarIndex::load(&path).unwrap();
    assert_eq!(index.len(), 500);
    for row in &rows {
        assert_eq!(index.find(&row.key), Some(*row));
    }
    assert_eq!(index.find(&blake2b_256(b"absent")), None);
}

#[test]
fn find_returns_first_matching_row() {
    let key = blake2b_256(b"dup");
    let rows = vec![Row::new(key, 100, 1), Row::new(key, 200, 1)];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.idx");
    CarIndexBuilder::new(rows).write_atomic(&path).unwrap();

    let index = CarIndex::load(&path).unwrap();
    assert_eq!(index.find(&key).unwrap().offset, 100);
}

#[test]
fn empty_index_has_only_sentinels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.idx");
    CarIndexBuilder::new([]).write_atomic(&path).unwrap();

    let meta = std::fs::metadata(&path).unwrap();
    assert_eq!(meta.len(), 2 * Row::SIZE as u64);

    let index = CarIndex::load(&path).unwrap();
    assert!(index.is_empty());
    assert_eq!(index.find(&blake2b_256(b"anything")), None);
}

#[test]
fn load_rejects_mangled_files() {
    let dir = tempfile::tempdir().unwrap();

    // No sentinels at all.
    let bare = dir.path().join("bare.idx");
    std::fs::write(&bare, Row::new(blake2b_256(b"x"), 10, 1).to_bytes()).unwrap();
    assert!(CarIndex::load(&bare).is_err());

    // Truncated mid-row.
    let truncated = dir.path().join("trunc.idx");
    let mut bytes = Row::HEADER_V0.to_bytes().to_vec();
    bytes.extend_from_slice(&Row::TRAILER_V0.to_bytes()[..20]);
    std::fs::write(&truncated, bytes).unwrap();
    assert!(CarIndex::load(&truncated).is_err());

    // Unsorted rows.
    let unsorted = dir.path().join("unsorted.idx");
    let mut bytes = Row::HEADER_V0.to_bytes().to_vec();
    bytes.extend_from_slice(&Row::new([9; 32], 10, 1).to_bytes());
    bytes.extend_from_slice(&Row::new([1; 32], 20, 1).to_bytes());
    bytes.extend_from_slice(&Row::TRAILER_V0.to_bytes());
    std::fs::write(&unsorted, bytes).unwrap();
    assert!(CarIndex::load(&unsorted).is_err());
}
