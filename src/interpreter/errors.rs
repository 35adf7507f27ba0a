// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::error::ExitCode;
use thiserror::Error;

/// Failure modes inside message execution.
///
/// Aborts (including out-of-gas) are part of normal operation: they are
/// caught at the innermost `send` boundary, revert that transaction and
/// become the message's exit code. Fatal errors are bugs or broken
/// invariants; they short-circuit the applier without producing a
/// receipt.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("out of gas")]
    OutOfGas,
    #[error("vm abort: {0:?}")]
    Abort(ExitCode),
    #[error("fatal execution error: {0}")]
    Fatal(anyhow::Error),
}

impl ExecutionError {
    /// Exit code a receipt reports for this error; fatal errors have
    /// none, they never make it into a receipt.
    pub fn exit_code(&self) -> Option<ExitCode> {
        match self {
            ExecutionError::OutOfGas => Some(ExitCode::SYS_OUT_OF_GAS),
            ExecutionError::Abort(code) => Some(*code),
            ExecutionError::Fatal(_) => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::Fatal(_))
    }
}

impl From<anyhow::Error> for ExecutionError {
    /// Recovers an `ExecutionError` that traveled through an `anyhow`
    /// boundary (the charging block store); everything else is fatal.
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<ExecutionError>() {
            Ok(e) => e,
            Err(e) => ExecutionError::Fatal(e),
        }
    }
}

/// Classifies fallible results at the execution boundary, preserving
/// aborts that crossed it inside an `anyhow::Error`.
pub trait ClassifyResult<T> {
    fn or_fatal(self) -> Result<T, ExecutionError>;
}

impl<T, E> ClassifyResult<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn or_fatal(self) -> Result<T, ExecutionError> {
        self.map_err(|e| ExecutionError::from(e.into()))
    }
}
