// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::db::MemoryDB;
use crate::ipld_hamt::{BytesKey, Hamt};
use quickcheck_macros::quickcheck;

fn key(s: &[u8]) -> BytesKey {
    BytesKey(s.to_vec())
}

#[test]
fn set_flush_reload_visit() {
    let db = MemoryDB::default();
    let mut map: Hamt<_, u64> = Hamt::new(&db);
    map.set(key(b"abc"), 0x01).unwrap();
    map.set(key(b"xyz"), 0x02).unwrap();
    let root = map.flush().unwrap();

    let map: Hamt<_, u64> = Hamt::load(&root, &db).unwrap();
    assert_eq!(map.get(&key(b"abc")).unwrap(), Some(&0x01));
    assert_eq!(map.get(&key(b"xyz")).unwrap(), Some(&0x02));
    assert!(map.contains_key(&key(b"abc")).unwrap());
    assert!(!map.contains_key(&key(b"nope")).unwrap());

    let mut entries = Vec::new();
    map.for_each(|k, v| {
        entries.push((k.clone(), *v));
        Ok(())
    })
    .unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.contains(&(key(b"abc"), 1)));
    assert!(entries.contains(&(key(b"xyz"), 2)));
}

#[test]
fn replace_returns_previous_value() {
    let db = MemoryDB::default();
    let mut map: Hamt<_, String> = Hamt::new(&db);
    assert_eq!(map.set(key(b"k"), "one".into()).unwrap(), None);
    assert_eq!(
        map.set(key(b"k"), "two".into()).unwrap(),
        Some("one".into())
    );
    assert_eq!(map.get(&key(b"k")).unwrap().map(String::as_str), Some("two"));
}

#[test]
fn buckets_split_and_stay_retrievable() {
    let db = MemoryDB::default();
    let mut map: Hamt<_, u64> = Hamt::new(&db);
    // Enough keys to overflow plenty of buckets at bit width 5.
    for i in 0..200u64 {
        map.set(key(format!("key-{i}").as_bytes()), i).unwrap();
    }
    let root = map.flush().unwrap();

    let map: Hamt<_, u64> = Hamt::load(&root, &db).unwrap();
    for i in 0..200u64 {
        assert_eq!(
            map.get(&key(format!("key-{i}").as_bytes())).unwrap(),
            Some(&i),
            "key-{i} must survive bucket splits"
        );
    }
    let mut count = 0;
    map.for_each(|_, _| {
        count += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 200);
}

#[test]
fn delete_collapses_to_empty_root() {
    let db = MemoryDB::default();
    let empty = Hamt::<_, u64>::new(&db).flush().unwrap();

    let mut map: Hamt<_, u64> = Hamt::new(&db);
    for i in 0..50u64 {
        map.set(key(format!("{i}").as_bytes()), i).unwrap();
    }
    for i in 0..50u64 {
        let (k, v) = map.delete(&key(format!("{i}").as_bytes())).unwrap().unwrap();
        assert_eq!(k, key(format!("{i}").as_bytes()));
        assert_eq!(v, i);
    }
    assert!(map.is_empty());
    assert_eq!(map.flush().unwrap(), empty);

    assert!(map.delete(&key(b"0")).unwrap().is_none());
}

#[test]
fn reload_after_delete_matches_fresh_insertion() {
    let db = MemoryDB::default();

    let reference = {
        let mut map: Hamt<_, u64> = Hamt::new(&db);
        for i in 0..8u64 {
            map.set(key(&[i as u8]), i).unwrap();
        }
        map.flush().unwrap()
    };

    let mut map: Hamt<_, u64> = Hamt::new(&db);
    for i in 0..16u64 {
        map.set(key(&[i as u8]), i).unwrap();
    }
    for i in 8..16u64 {
        map.delete(&key(&[i as u8])).unwrap().unwrap();
    }
    assert_eq!(map.flush().unwrap(), reference);
}

#[quickcheck]
fn insertion_order_does_not_change_root(mut entries: Vec<(Vec<u8>, u64)>) {
    entries.sort();
    entries.dedup_by(|a, b| a.0 == b.0);

    let db = MemoryDB::default();
    let forward = {
        let mut map: Hamt<_, u64> = Hamt::new(&db);
        for (k, v) in entries.iter() {
            map.set(BytesKey(k.clone()), *v).unwrap();
        }
        map.flush().unwrap()
    };
    let backward = {
        let mut map: Hamt<_, u64> = Hamt::new(&db);
        for (k, v) in entries.iter().rev() {
            map.set(BytesKey(k.clone()), *v).unwrap();
        }
        map.flush().unwrap()
    };
    assert_eq!(forward, backward);
}
