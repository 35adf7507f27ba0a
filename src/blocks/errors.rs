// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Tipsets hold at least one block header.
    #[error("cannot construct an empty tipset")]
    EmptyTipset,
    /// All members of a tipset agree on the named field.
    #[error("tipset headers disagree on {0}")]
    HeaderMismatch(&'static str),
}
