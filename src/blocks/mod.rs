// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod errors;
mod header;
mod tipset;

pub use errors::Error;
pub use header::BlockHeader;
pub use tipset::{Tipset, TipsetKey};

#[cfg(test)]
mod tests {
    mod tipset_tests;
}
