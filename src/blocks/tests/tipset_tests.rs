// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::blocks::{Error, Tipset, TipsetKey};
use crate::test_utils::dummy_header;
use fvm_shared::address::Address;

#[test]
fn empty_tipset_is_rejected() {
    assert_eq!(Tipset::new(vec![]).unwrap_err(), Error::EmptyTipset);
}

#[test]
fn members_must_agree() {
    let a = dummy_header(5, vec![]);
    let mut b = a.clone();
    b.miner = Address::new_id(2000);

    let ts = Tipset::new(vec![a.clone(), b.clone()]).unwrap();
    assert_eq!(ts.len(), 2);
    assert_eq!(ts.epoch(), 5);

    let mut wrong_epoch = b.clone();
    wrong_epoch.epoch = 6;
    assert_eq!(
        Tipset::new(vec![a.clone(), wrong_epoch]).unwrap_err(),
        Error::HeaderMismatch("epoch")
    );

    let mut wrong_state = b;
    wrong_state.parent_state_root = crate::test_utils::dummy_header(9, vec![]).parent_state_root;
    assert_eq!(
        Tipset::new(vec![a, wrong_state]).unwrap_err(),
        Error::HeaderMismatch("parent state root")
    );
}

#[test]
fn key_is_order_independent_and_deduplicated() {
    let a = dummy_header(5, vec![]);
    let mut b = a.clone();
    b.miner = Address::new_id(2000);

    let forward = Tipset::new(vec![a.clone(), b.clone()]).unwrap();
    let backward = Tipset::new(vec![b.clone(), a.clone()]).unwrap();
    assert_eq!(forward.key(), backward.key());
    assert_eq!(forward, backward);

    let dup = Tipset::new(vec![a.clone(), a.clone(), b]).unwrap();
    assert_eq!(dup.len(), 2);

    let single = Tipset::new(vec![a.clone()]).unwrap();
    assert_eq!(single.key(), TipsetKey::new(vec![a.cid()]));
}
