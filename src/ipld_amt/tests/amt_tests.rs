// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::db::MemoryDB;
use crate::ipld_amt::{Amt, MAX_INDEX};
use quickcheck_macros::quickcheck;

#[test]
fn single_leaf() {
    let db = MemoryDB::default();
    let mut amt = Amt::new(&db);

    amt.set(3, 0x07u64).unwrap();
    assert_eq!(amt.get(3).unwrap(), Some(&0x07));
    assert_eq!(amt.count(), 1);
    assert_eq!(amt.height(), 0);

    assert_eq!(amt.delete(3).unwrap(), Some(0x07));
    assert_eq!(amt.get(3).unwrap(), None);
    assert_eq!(amt.count(), 0);
}

#[test]
fn grow_and_collapse() {
    let db = MemoryDB::default();

    let reference = {
        let mut amt = Amt::new(&db);
        amt.set(1, 0x06u64).unwrap();
        amt.flush().unwrap()
    };

    let mut amt = Amt::new(&db);
    amt.set(1, 0x06u64).unwrap();
    amt.set(64, 0x07).unwrap();
    assert!(amt.height() > 0);
    assert_eq!(amt.get(64).unwrap(), Some(&0x07));

    assert_eq!(amt.delete(64).unwrap(), Some(0x07));
    assert_eq!(amt.height(), 0);
    assert_eq!(amt.flush().unwrap(), reference);
}

#[test]
fn delete_all_restores_empty_root() {
    let db = MemoryDB::default();
    let empty = Amt::<u64, _>::new(&db).flush().unwrap();

    let mut amt = Amt::new(&db);
    for i in [0u64, 9, 64, 511, 512] {
        amt.set(i, i).unwrap();
    }
    for i in [512u64, 0, 9, 511, 64] {
        assert!(amt.delete(i).unwrap().is_some());
    }
    assert_eq!(amt.count(), 0);
    assert_eq!(amt.flush().unwrap(), empty);
}

#[test]
fn append_uses_count_as_index() {
    let db = MemoryDB::default();
    let mut amt = Amt::new(&db);
    amt.append("a".to_string()).unwrap();
    amt.append("b".to_string()).unwrap();
    assert_eq!(amt.get(0).unwrap().map(String::as_str), Some("a"));
    assert_eq!(amt.get(1).unwrap().map(String::as_str), Some("b"));

    // A hole shifts where append lands: count, not max index + 1.
    amt.set(10, "j".to_string()).unwrap();
    amt.append("c".to_string()).unwrap();
    assert_eq!(amt.get(3).unwrap().map(String::as_str), Some("c"));
}

#[test]
fn out_of_range_index_is_rejected() {
    let db = MemoryDB::default();
    let mut amt = Amt::new(&db);
    assert!(amt.set(MAX_INDEX + 1, 0u64).is_err());
    assert!(amt.get(MAX_INDEX + 1).is_err());
    assert!(amt.set(MAX_INDEX, 0u64).is_ok());
}

#[test]
fn flush_reload_round_trip() {
    let db = MemoryDB::default();
    let mut amt = Amt::new(&db);
    for i in 0..40u64 {
        amt.set(i * 13, i).unwrap();
    }
    let root = amt.flush().unwrap();

    let reloaded = Amt::<u64, _>::load(&root, &db).unwrap();
    assert_eq!(reloaded.count(), 40);
    for i in 0..40u64 {
        assert_eq!(reloaded.get(i * 13).unwrap(), Some(&i));
    }
}

#[test]
fn for_each_visits_in_key_order() {
    let db = MemoryDB::default();
    let mut amt = Amt::new(&db);
    let keys = [88u64, 3, 1000, 0, 512];
    for &k in &keys {
        amt.set(k, k).unwrap();
    }
    let root = amt.flush().unwrap();

    let amt = Amt::<u64, _>::load(&root, &db).unwrap();
    let mut visited = Vec::new();
    amt.for_each(|k, v| {
        assert_eq!(k, *v);
        visited.push(k);
        Ok(())
    })
    .unwrap();
    let mut sorted = keys.to_vec();
    sorted.sort_unstable();
    assert_eq!(visited, sorted);

    let mut first_two = Vec::new();
    amt.for_each_while(|k, _| {
        first_two.push(k);
        Ok(first_two.len() < 2)
    })
    .unwrap();
    assert_eq!(first_two, &sorted[..2]);
}

#[quickcheck]
fn insertion_order_does_not_change_root(mut pairs: Vec<(u16, u64)>) {
    pairs.sort_unstable_by_key(|(k, _)| *k);
    pairs.dedup_by_key(|(k, _)| *k);

    let db = MemoryDB::default();
    let sorted_root = {
        let mut amt = Amt::new(&db);
        for &(k, v) in &pairs {
            amt.set(k as u64, v).unwrap();
        }
        amt.flush().unwrap()
    };
    let reversed_root = {
        let mut amt = Amt::new(&db);
        for &(k, v) in pairs.iter().rev() {
            amt.set(k as u64, v).unwrap();
        }
        amt.flush().unwrap()
    };
    assert_eq!(sorted_root, reversed_root);

    let amt = Amt::<u64, _>::load(&sorted_root, &db).unwrap();
    assert_eq!(amt.count(), pairs.len() as u64);
}
