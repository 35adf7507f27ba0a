// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::*;
use crate::db::MemoryDB;
use crate::utils::cid::CidCborExt;
use multihash_codetable::{Code, MultihashDigest};
use fvm_ipld_encoding::CborStore;

fn scratch_store(dir: &tempfile::TempDir) -> CarStore {
    CarStore::create(
        dir.path().join("chain.car"),
        dir.path().join("chain.car.idx"),
        vec![],
    )
    .unwrap()
}

#[test]
fn put_get_round_trip_through_written_set() {
    let dir = tempfile::tempdir().unwrap();
    let store = scratch_store(&dir);

    let cid = store.put_cbor(&"payload", Code::Blake2b256).unwrap();
    // Idempotent re-put.
    store.put_cbor(&"payload", Code::Blake2b256).unwrap();

    assert!(store.has(&cid).unwrap());
    assert_eq!(
        store.get_cbor::<String>(&cid).unwrap().as_deref(),
        Some("payload")
    );
    assert!(!store.has(&Cid::from_cbor_blake2b256(&"absent").unwrap()).unwrap());
}

#[test]
fn blocks_survive_reopen_via_index_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let car = dir.path().join("chain.car");
    let idx = dir.path().join("chain.car.idx");

    let mut cids = Vec::new();
    {
        let store = CarStore::create(&car, &idx, vec![]).unwrap();
        for i in 0..50u64 {
            cids.push(store.put_cbor(&(i, format!("block {i}")), Code::Blake2b256).unwrap());
        }
        store.flush_written().unwrap();
    }

    // The merged index serves all blocks after reopening read-only.
    let store = CarStore::open(&car, &idx).unwrap();
    for (i, cid) in cids.iter().enumerate() {
        let (n, text) = store.get_cbor::<(u64, String)>(cid).unwrap().unwrap();
        assert_eq!(n, i as u64);
        assert_eq!(text, format!("block {i}"));
    }

    // Deleting the index forces a full rescan with identical results.
    std::fs::remove_file(&idx).unwrap();
    let store = CarStore::open(&car, &idx).unwrap();
    for cid in &cids {
        assert!(store.has(cid).unwrap());
    }
}

#[test]
fn flush_written_is_idempotent_and_prunes() {
    let dir = tempfile::tempdir().unwrap();
    let store = scratch_store(&dir);

    let cid = store.put_cbor(&1u64, Code::Blake2b256).unwrap();
    store.flush_written().unwrap();
    store.flush_written().unwrap();
    assert!(store.written.read().is_empty());
    assert!(store.has(&cid).unwrap());
}

#[test]
fn read_only_store_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let car = dir.path().join("ro.car");
    let idx = dir.path().join("ro.car.idx");
    {
        let store = CarStore::create(&car, &idx, vec![]).unwrap();
        store.put_cbor(&1u64, Code::Blake2b256).unwrap();
        store.flush_written().unwrap();
    }
    let store = CarStore::open(&car, &idx).unwrap();
    assert!(store.put_cbor(&2u64, Code::Blake2b256).is_err());
}

#[test]
fn export_import_preserves_closure_and_roots() {
    let mem = MemoryDB::default();
    let leaf = mem.put_cbor(&"leaf", Code::Blake2b256).unwrap();
    let root = mem.put_cbor(&(7u64, leaf), Code::Blake2b256).unwrap();
    let stray = mem.put_cbor(&"stray", Code::Blake2b256).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let car = dir.path().join("snap.car");
    let idx = dir.path().join("snap.car.idx");
    {
        let mut writer = std::io::BufWriter::new(std::fs::File::create(&car).unwrap());
        let count = export_car(&mem, &[root], &mut writer).unwrap();
        assert_eq!(count, 2);
    }

    let store = CarStore::open(&car, &idx).unwrap();
    assert_eq!(store.roots(), &[root]);
    assert!(store.has(&root).unwrap());
    assert!(store.has(&leaf).unwrap());
    assert!(!store.has(&stray).unwrap());
    assert_eq!(
        store.get_cbor::<String>(&leaf).unwrap().as_deref(),
        Some("leaf")
    );
}

#[test]
fn compact_drops_unreachable_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = scratch_store(&dir);

    let keep_leaf = store.put_cbor(&"keep me", Code::Blake2b256).unwrap();
    let keep_root = store.put_cbor(&(1u64, keep_leaf), Code::Blake2b256).unwrap();
    let garbage = store.put_cbor(&"garbage", Code::Blake2b256).unwrap();

    let compacted = compact(
        &store,
        &[keep_root],
        dir.path().join("compacted.car"),
        dir.path().join("compacted.car.idx"),
    )
    .unwrap();

    assert_eq!(compacted.roots(), &[keep_root]);
    assert!(compacted.has(&keep_root).unwrap());
    assert!(compacted.has(&keep_leaf).unwrap());
    assert!(!compacted.has(&garbage).unwrap());

    // The new archive accepts appends.
    let more = compacted.put_cbor(&"more", Code::Blake2b256).unwrap();
    assert!(compacted.has(&more).unwrap());
}

#[test]
fn created_index_rows_verify_against_their_keys() {
    // Every row emitted by index creation resolves through `find` and
    // reads back bytes whose digest is the row key.
    let mem = MemoryDB::default();
    let mut cids = vec![];
    let mut prev = None;
    for i in 0..20u64 {
        let cid = match prev {
            None => mem.put_cbor(&i, Code::Blake2b256).unwrap(),
            Some(p) => mem.put_cbor(&(i, p), Code::Blake2b256).unwrap(),
        };
        cids.push(cid);
        prev = Some(cid);
    }
    let root = prev.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let car = dir.path().join("chain.car");
    let idx = dir.path().join("chain.car.idx");
    {
        let mut writer = std::fs::File::create(&car).unwrap();
        export_car(&mem, &[root], &mut writer).unwrap();
    }
    let indexed = index::builder::create(&car, &idx).unwrap();
    assert_eq!(indexed, cids.len());

    let store = CarStore::open(&car, &idx).unwrap();
    let index = store.index.read().clone();
    for cid in &cids {
        let key = crate::utils::cid::blake2b_digest(cid).unwrap();
        let row = index.find(&key).expect("every created row is findable");
        let payload = store.read_row(&row).unwrap();
        let rebuilt = Cid::new_v1(
            fvm_ipld_encoding::DAG_CBOR,
            Code::Blake2b256.digest(&payload),
        );
        assert_eq!(crate::utils::cid::blake2b_digest(&rebuilt).unwrap(), row.key);
    }
}
