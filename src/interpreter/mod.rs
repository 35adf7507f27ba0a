// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Message application pipeline.
//!
//! A [`VM`] is instantiated per parent state over a buffered writer; it
//! applies messages one at a time: charge inclusion gas, validate and
//! debit the sender, run the send inside a state-tree transaction with a
//! gas-charging IPLD view, settle gas into burns, the miner tip and the
//! sender refund, and emit a receipt. Nested sends run in nested
//! transactions; an abort unwinds exactly the transaction it happened in.

pub mod builtin;
mod errors;
mod gas;
mod vm;

pub use builtin::{AccountActor, AccountState, ActorCode, ActorRegistry};
pub use errors::{ClassifyResult, ExecutionError};
pub use gas::{price_list_by_epoch, Gas, GasCharge, GasOutputs, GasTracker, PriceList};
pub use vm::{ChargingBlockstore, InvocationRuntime, Rand, VM};

use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::{Address, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

/// Singleton system actor, the nominal sender of internally-generated
/// messages (actor constructors, cron-style calls).
pub const SYSTEM_ACTOR_ADDR: Address = Address::new_id(0);
/// Singleton reward actor, credited with miner tips.
pub const REWARD_ACTOR_ADDR: Address = Address::new_id(2);
/// Singleton burnt-funds actor; tokens sent here are destroyed for
/// accounting purposes but remain visible for conservation checks.
pub const BURNT_FUNDS_ACTOR_ADDR: Address = Address::new_id(99);

/// Epoch of the Claus upgrade: from here on, successful
/// `SubmitWindowedPoSt` messages to miner actors are exempt from the base
/// fee burn.
pub const UPGRADE_CLAUS_HEIGHT: ChainEpoch = 343_200;

/// `true` for addresses derived from keys, the only addresses an account
/// actor can be auto-created at.
pub fn is_key_address(addr: &Address) -> bool {
    matches!(addr.protocol(), Protocol::Secp256k1 | Protocol::BLS)
}

/// Outcome of an applied message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct Receipt {
    pub exit_code: ExitCode,
    pub return_data: RawBytes,
    pub gas_used: Gas,
}

/// Receipt plus the amounts the chain layer settles outside the state
/// tree: the miner penalty and the miner tip.
#[derive(Debug, Clone)]
pub struct ApplyRet {
    pub msg_receipt: Receipt,
    pub penalty: TokenAmount,
    pub miner_tip: TokenAmount,
}

impl ApplyRet {
    /// Failure before execution: the message pays a penalty and nothing
    /// else happens.
    fn penalized(exit_code: ExitCode, penalty: TokenAmount) -> Self {
        ApplyRet {
            msg_receipt: Receipt {
                exit_code,
                return_data: RawBytes::default(),
                gas_used: 0,
            },
            penalty,
            miner_tip: TokenAmount::zero(),
        }
    }
}
