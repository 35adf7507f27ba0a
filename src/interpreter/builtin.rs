// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Actor code registry and the built-in account actor.
//!
//! Actor code is addressed by CID; built-in families use raw
//! identity-hashed CIDs of their manifest names, so multiple versions of
//! a family can coexist in one registry. The registry is populated at
//! startup from the compiled-in set.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use cid::multihash::Multihash;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{RawBytes, IPLD_RAW};
use fvm_shared::address::Address;
use fvm_shared::error::ExitCode;
use fvm_shared::{MethodNum, METHOD_CONSTRUCTOR};
use once_cell::sync::Lazy;

use super::errors::{ClassifyResult, ExecutionError};
use super::is_key_address;
use super::vm::InvocationRuntime;

fn builtin_code(name: &str) -> Cid {
    let mh = Multihash::wrap(0, name.as_bytes()).expect("manifest names are short");
    Cid::new_v1(IPLD_RAW, mh)
}

pub static ACCOUNT_ACTOR_CODE: Lazy<Cid> = Lazy::new(|| builtin_code("fil/7/account"));
pub static INIT_ACTOR_CODE: Lazy<Cid> = Lazy::new(|| builtin_code("fil/7/init"));
pub static SYSTEM_ACTOR_CODE: Lazy<Cid> = Lazy::new(|| builtin_code("fil/7/system"));
pub static REWARD_ACTOR_CODE: Lazy<Cid> = Lazy::new(|| builtin_code("fil/7/reward"));
pub static MINER_ACTOR_CODE: Lazy<Cid> = Lazy::new(|| builtin_code("fil/7/storageminer"));

pub fn is_account_code(code: &Cid) -> bool {
    code == &*ACCOUNT_ACTOR_CODE
}

pub fn is_miner_code(code: &Cid) -> bool {
    code == &*MINER_ACTOR_CODE
}

/// Method 5 on the miner actor; exempt from the base fee burn after the
/// Claus upgrade.
pub const MINER_SUBMIT_WINDOWED_POST_METHOD: MethodNum = 5;

/// Dispatch interface of actor code. The runtime hands the actor its
/// view of the world: message info, charging IPLD, state access, nested
/// sends, randomness.
pub trait ActorCode<BS: Blockstore> {
    fn invoke(
        &self,
        rt: &mut InvocationRuntime<'_, '_, BS>,
        method: MethodNum,
        params: &RawBytes,
    ) -> Result<RawBytes, ExecutionError>;
}

/// Registry mapping actor code CIDs to their implementations.
pub struct ActorRegistry<BS> {
    code: HashMap<Cid, Arc<dyn ActorCode<BS>>>,
}

impl<BS: Blockstore> ActorRegistry<BS> {
    /// Registry holding the compiled-in set.
    pub fn new_with_builtins() -> Self {
        let mut registry = ActorRegistry {
            code: HashMap::new(),
        };
        registry.register(*ACCOUNT_ACTOR_CODE, Arc::new(AccountActor));
        registry
    }

    pub fn register(&mut self, code: Cid, actor: Arc<dyn ActorCode<BS>>) {
        self.code.insert(code, actor);
    }

    pub fn get(&self, code: &Cid) -> Option<Arc<dyn ActorCode<BS>>> {
        self.code.get(code).cloned()
    }
}

/// State of an account actor: the key address it was constructed for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct AccountState {
    pub address: Address,
}

/// Built-in account actor: holds funds for a key address and reports it.
pub struct AccountActor;

impl AccountActor {
    pub const PUBKEY_ADDRESS_METHOD: MethodNum = 2;
}

impl<BS: Blockstore> ActorCode<BS> for AccountActor {
    fn invoke(
        &self,
        rt: &mut InvocationRuntime<'_, '_, BS>,
        method: MethodNum,
        params: &RawBytes,
    ) -> Result<RawBytes, ExecutionError> {
        match method {
            METHOD_CONSTRUCTOR => {
                let address: Address = params
                    .deserialize()
                    .map_err(|_| ExecutionError::Abort(ExitCode::USR_SERIALIZATION))?;
                if !is_key_address(&address) {
                    return Err(ExecutionError::Abort(ExitCode::USR_ILLEGAL_ARGUMENT));
                }
                rt.set_state(&AccountState { address })?;
                Ok(RawBytes::default())
            }
            Self::PUBKEY_ADDRESS_METHOD => {
                let state: AccountState = rt.state()?;
                Ok(RawBytes::serialize(&state.address).or_fatal()?)
            }
            _ => Err(ExecutionError::Abort(ExitCode::USR_UNHANDLED_MESSAGE)),
        }
    }
}
