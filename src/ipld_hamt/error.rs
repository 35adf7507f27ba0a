// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::error::Error as StdError;

use anyhow::anyhow;
use fvm_ipld_encoding::Error as EncodingError;
use thiserror::Error;

/// HAMT Error
#[derive(Debug, Error)]
pub enum Error {
    /// Maximum depth exceeded: the 256-bit digest ran out of digits
    #[error("maximum depth reached")]
    MaxDepth,
    /// Hash bits does not support greater than 8 bit width
    #[error("hash bits does not support retrieving more than 8 bits")]
    InvalidHashBitLen,
    /// Serialized node contains a child with no pointers
    #[error("serialized node cannot contain zero pointers")]
    ZeroPointers,
    /// Serializing a node whose children were modified but not flushed
    #[error("tried to serialize without saving cache, run flush() on Hamt before serializing")]
    Cached,
    /// Cid not found in store error
    #[error("cid ({0}) did not match any in database")]
    CidNotFound(String),
    /// Dynamic error for when the error needs to be forwarded as is.
    #[error("{0}")]
    Dynamic(anyhow::Error),
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        e.downcast::<Error>().unwrap_or_else(Self::Dynamic)
    }
}

impl From<EncodingError> for Error {
    fn from(e: EncodingError) -> Self {
        Self::Dynamic(anyhow!(e))
    }
}

impl From<Box<dyn StdError + Send + Sync>> for Error {
    fn from(e: Box<dyn StdError + Send + Sync>) -> Self {
        Self::Dynamic(anyhow!(e))
    }
}
