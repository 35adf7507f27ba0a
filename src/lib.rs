// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Content-addressed state engine for a Filecoin-compatible node.
//!
//! The crate is organized around a single capability — a [`Blockstore`] of
//! immutable `(Cid, bytes)` pairs — and the layers built on top of it:
//! persistent CAR archives with a sorted side index ([`db::car`]), a
//! write-back buffer flushed by reachability ([`db::buffered`]), the
//! AMT/HAMT authenticated tries ([`ipld_amt`], [`ipld_hamt`]), the actor
//! state tree ([`state_tree`]) and the message interpreter
//! ([`interpreter`]).
//!
//! [`Blockstore`]: fvm_ipld_blockstore::Blockstore

#![recursion_limit = "1024"]

pub mod blocks;
pub mod chain;
pub mod db;
pub mod interpreter;
pub mod ipld;
pub mod ipld_amt;
pub mod ipld_hamt;
pub mod state_tree;
pub mod utils;

#[cfg(test)]
mod test_utils;
