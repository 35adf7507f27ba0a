// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::{ensure, Context as _};
use multihash_codetable::Code;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{CborStore, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::bigint::Sign;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::message::Message;
use fvm_shared::version::NetworkVersion;
use fvm_shared::{ActorID, MethodNum, METHOD_CONSTRUCTOR, METHOD_SEND};
use num_traits::Zero;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::builtin::{self, ActorRegistry};
use super::errors::{ClassifyResult, ExecutionError};
use super::gas::{price_list_by_epoch, GasCharge, GasOutputs, GasTracker, PriceList};
use super::{
    is_key_address, ApplyRet, Receipt, BURNT_FUNDS_ACTOR_ADDR, REWARD_ACTOR_ADDR,
    SYSTEM_ACTOR_ADDR, UPGRADE_CLAUS_HEIGHT,
};
use crate::db::buffered::BufferedBlockstore;
use crate::state_tree::{ActorState, StateTree};

/// Randomness source the runtime exposes to actor code, keyed by
/// domain-separation tag, epoch and entropy.
pub trait Rand {
    fn get_chain_randomness(
        &self,
        pers: i64,
        round: ChainEpoch,
        entropy: &[u8],
    ) -> anyhow::Result<[u8; 32]>;

    fn get_beacon_randomness(
        &self,
        pers: i64,
        round: ChainEpoch,
        entropy: &[u8],
    ) -> anyhow::Result<[u8; 32]>;
}

/// Execution environment for the messages of one tipset: a state tree
/// over a buffered writer, the epoch context, and the actor registry.
///
/// Internally single-threaded; parallel VMs must run on disjoint parent
/// states.
pub struct VM<DB: Blockstore> {
    state_tree: StateTree<BufferedBlockstore<DB>>,
    epoch: ChainEpoch,
    base_fee: TokenAmount,
    network_version: NetworkVersion,
    price_list: &'static PriceList,
    registry: ActorRegistry<DB>,
    rand: Box<dyn Rand>,
}

impl<DB: Blockstore> VM<DB> {
    pub fn new(
        store: DB,
        state_root: &Cid,
        epoch: ChainEpoch,
        base_fee: TokenAmount,
        network_version: NetworkVersion,
        registry: ActorRegistry<DB>,
        rand: Box<dyn Rand>,
    ) -> anyhow::Result<Self> {
        let state_tree = StateTree::new_from_root(BufferedBlockstore::new(store), state_root)?;
        Ok(VM {
            state_tree,
            epoch,
            base_fee,
            network_version,
            price_list: price_list_by_epoch(epoch),
            registry,
            rand,
        })
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.epoch
    }

    pub fn state_tree(&self) -> &StateTree<BufferedBlockstore<DB>> {
        &self.state_tree
    }

    pub fn state_tree_mut(&mut self) -> &mut StateTree<BufferedBlockstore<DB>> {
        &mut self.state_tree
    }

    /// Flushes the state tree and promotes the new root's closure into
    /// the backing store. The returned CID is the only durable output of
    /// message application.
    pub fn flush(&mut self) -> anyhow::Result<Cid> {
        let root = self.state_tree.flush()?;
        self.state_tree.store().flush(&root)?;
        Ok(root)
    }

    /// Applies a chain message and returns its receipt with the penalty
    /// and miner tip. `raw_length` is the encoded size of the message as
    /// it appears on chain. A fatal error yields `Err` and poisons this
    /// VM; no receipt is produced.
    pub fn apply_message(&mut self, msg: &Message, raw_length: usize) -> anyhow::Result<ApplyRet> {
        ensure!(msg.gas_limit > 0, "message gas limit must be positive");

        // 1. Inclusion cost; a message that cannot even pay for its own
        //    bytes penalizes the miner that included it.
        let inclusion = self.price_list.on_chain_message(raw_length);
        let inclusion_total = inclusion.total();
        if inclusion_total > msg.gas_limit as i64 {
            return Ok(ApplyRet::penalized(
                ExitCode::SYS_OUT_OF_GAS,
                TokenAmount::from_atto(self.base_fee.atto() * inclusion_total as u64),
            ));
        }

        // 2. Sender checks: existing account actor, matching nonce,
        //    funds covering the full gas reserve.
        let base_penalty = TokenAmount::from_atto(self.base_fee.atto() * msg.gas_limit);
        let Some(mut sender) = self.state_tree.get_actor(&msg.from)? else {
            return Ok(ApplyRet::penalized(
                ExitCode::SYS_SENDER_INVALID,
                base_penalty,
            ));
        };
        if !builtin::is_account_code(&sender.code) {
            return Ok(ApplyRet::penalized(
                ExitCode::SYS_SENDER_INVALID,
                base_penalty,
            ));
        }
        if msg.sequence != sender.sequence {
            return Ok(ApplyRet::penalized(
                ExitCode::SYS_SENDER_STATE_INVALID,
                base_penalty,
            ));
        }
        let gas_cost = TokenAmount::from_atto(msg.gas_fee_cap.atto() * msg.gas_limit);
        if sender.balance < gas_cost {
            return Ok(ApplyRet::penalized(
                ExitCode::SYS_SENDER_STATE_INVALID,
                base_penalty,
            ));
        }
        sender.deduct_funds(&gas_cost)?;
        sender.sequence += 1;
        self.state_tree.set_actor(&msg.from, sender)?;

        // 3./4. Execute inside a sandbox transaction.
        self.state_tree.begin_transaction();
        let mut call = CallManager {
            gas: GasTracker::new(msg.gas_limit as i64),
            vm: self,
        };
        let send_result = call.send(&InternalMessage::from_parts(msg), Some(inclusion));
        let (mut exit_code, mut ret) = match send_result {
            Ok(value) => (ExitCode::OK, value),
            Err(ExecutionError::Fatal(e)) => {
                return Err(e.context(format!(
                    "fatal error applying message from {} to {}",
                    msg.from, msg.to
                )))
            }
            Err(err) => (
                err.exit_code().expect("non-fatal errors carry exit codes"),
                RawBytes::default(),
            ),
        };

        // 5. Storing the return value costs gas too; failing that charge
        //    demotes the whole message to out-of-gas.
        if exit_code.is_success() && !ret.is_empty() {
            match call
                .gas
                .charge(call.vm.price_list.on_chain_return_value(ret.len()))
            {
                Ok(()) => {}
                Err(ExecutionError::Fatal(e)) => return Err(e),
                Err(err) => {
                    exit_code = err.exit_code().expect("non-fatal errors carry exit codes");
                    ret = RawBytes::default();
                }
            }
        }
        let gas_used = call.gas.gas_used().clamp(0, msg.gas_limit as i64);
        drop(call);

        // 6. Keep or revert the sandbox.
        if !exit_code.is_success() {
            self.state_tree.revert_transaction();
        }

        // 7. Gas settlement. The prepaid reserve splits into the base fee
        //    burn, the miner tip, the overestimation burn and the sender
        //    refund; nothing is created or destroyed.
        let no_base_fee_burn = exit_code.is_success()
            && self.epoch > UPGRADE_CLAUS_HEIGHT
            && msg.method_num == builtin::MINER_SUBMIT_WINDOWED_POST_METHOD
            && self
                .state_tree
                .get_actor(&msg.to)?
                .is_some_and(|a| builtin::is_miner_code(&a.code));

        let outputs = GasOutputs::compute(
            gas_used as u64,
            msg.gas_limit,
            &self.base_fee,
            &msg.gas_fee_cap,
            &msg.gas_premium,
        );

        let mut locked = gas_cost;
        if !no_base_fee_burn {
            self.credit(&BURNT_FUNDS_ACTOR_ADDR, &outputs.base_fee_burn)?;
            locked -= outputs.base_fee_burn.clone();
        }
        self.credit(&REWARD_ACTOR_ADDR, &outputs.miner_tip)?;
        locked -= outputs.miner_tip.clone();
        self.credit(&BURNT_FUNDS_ACTOR_ADDR, &outputs.over_estimation_burn)?;
        locked -= outputs.over_estimation_burn.clone();
        ensure!(
            locked.atto().sign() != Sign::Minus,
            "gas settlement owes more than the prepaid reserve"
        );
        self.credit(&msg.from, &locked)?;

        self.state_tree.end_transaction()?;

        trace!(
            exit_code = exit_code.value(),
            gas_used,
            "applied message"
        );
        Ok(ApplyRet {
            msg_receipt: Receipt {
                exit_code,
                return_data: ret,
                gas_used,
            },
            penalty: outputs.miner_penalty,
            miner_tip: outputs.miner_tip,
        })
    }

    /// Applies an internally-generated message: no gas accounting, no
    /// sender validation, no settlement. Only the receipt is returned.
    pub fn apply_implicit_message(&mut self, msg: &Message) -> anyhow::Result<Receipt> {
        let gas_limit = if msg.gas_limit > 0 {
            msg.gas_limit as i64
        } else {
            i64::MAX
        };
        let mut call = CallManager {
            gas: GasTracker::new(gas_limit),
            vm: self,
        };
        match call.send(&InternalMessage::from_parts(msg), None) {
            Ok(value) => Ok(Receipt {
                exit_code: ExitCode::OK,
                return_data: value,
                gas_used: 0,
            }),
            Err(ExecutionError::Fatal(e)) => Err(e),
            Err(err) => Ok(Receipt {
                exit_code: err.exit_code().expect("non-fatal errors carry exit codes"),
                return_data: RawBytes::default(),
                gas_used: 0,
            }),
        }
    }

    /// Deposits into an actor's balance; the actor must exist.
    fn credit(&mut self, addr: &Address, amount: &TokenAmount) -> anyhow::Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let mut actor = self
            .state_tree
            .get_actor(addr)?
            .with_context(|| format!("settlement actor {addr} is missing"))?;
        actor.deposit_funds(amount);
        self.state_tree.set_actor(addr, actor)
    }
}

/// Message fields a send carries; gas terms live with the outer chain
/// message only.
pub(crate) struct InternalMessage {
    pub from: Address,
    pub to: Address,
    pub value: TokenAmount,
    pub method: MethodNum,
    pub params: RawBytes,
}

impl InternalMessage {
    fn from_parts(msg: &Message) -> Self {
        InternalMessage {
            from: msg.from,
            to: msg.to,
            value: msg.value.clone(),
            method: msg.method_num,
            params: msg.params.clone(),
        }
    }
}

/// Call stack of one message application: the shared gas meter plus the
/// VM borrow every nested send goes through.
pub(crate) struct CallManager<'vm, DB: Blockstore> {
    pub(crate) vm: &'vm mut VM<DB>,
    pub(crate) gas: GasTracker,
}

impl<'vm, DB: Blockstore> CallManager<'vm, DB> {
    /// Delivers a message to its receiver: auto-creates account actors at
    /// fresh key addresses, charges the invocation, moves value, then
    /// dispatches through the registry. Nested sends recurse through
    /// [`Self::send_with_revert`].
    fn send(
        &mut self,
        msg: &InternalMessage,
        inclusion: Option<GasCharge>,
    ) -> Result<RawBytes, ExecutionError> {
        if let Some(charge) = inclusion {
            self.gas.charge(charge)?;
        }

        let to_actor = match self.vm.state_tree.get_actor(&msg.to).or_fatal()? {
            Some(actor) => actor,
            None => self.create_account_actor(&msg.to)?,
        };

        self.gas
            .charge(self.vm.price_list.on_method_invocation(&msg.value, msg.method))?;

        let caller_id = self
            .vm
            .state_tree
            .lookup_id(&msg.from)
            .or_fatal()?
            .ok_or(ExecutionError::Abort(ExitCode::SYS_SENDER_INVALID))?;
        let receiver_id = self
            .vm
            .state_tree
            .lookup_id(&msg.to)
            .or_fatal()?
            .context("receiver actor lost its id")
            .or_fatal()?;

        if !msg.value.is_zero() {
            if msg.value.atto().sign() == Sign::Minus {
                return Err(ExecutionError::Abort(ExitCode::SYS_ASSERTION_FAILED));
            }
            if receiver_id != caller_id {
                self.transfer(caller_id, receiver_id, &msg.value)?;
            }
        }

        if msg.method == METHOD_SEND {
            return Ok(RawBytes::default());
        }

        let Some(actor_impl) = self.vm.registry.get(&to_actor.code) else {
            return Err(ExecutionError::Abort(ExitCode::SYS_INVALID_RECEIVER));
        };
        let mut rt = InvocationRuntime {
            caller: caller_id,
            receiver: receiver_id,
            value_received: msg.value.clone(),
            method: msg.method,
            call: self,
        };
        actor_impl.invoke(&mut rt, msg.method, &msg.params)
    }

    /// Runs a send inside its own state-tree transaction; aborts revert
    /// exactly that transaction and propagate.
    pub(crate) fn send_with_revert(
        &mut self,
        msg: &InternalMessage,
    ) -> Result<RawBytes, ExecutionError> {
        self.vm.state_tree.begin_transaction();
        let result = self.send(msg, None);
        if result.is_err() {
            self.vm.state_tree.revert_transaction();
        }
        self.vm
            .state_tree
            .end_transaction()
            .map_err(ExecutionError::Fatal)?;
        result
    }

    /// Creates an account actor at a fresh key address and runs its
    /// constructor; anything else at the receiver is an invalid receiver.
    fn create_account_actor(&mut self, addr: &Address) -> Result<ActorState, ExecutionError> {
        self.gas.charge(self.vm.price_list.on_create_actor())?;
        if !is_key_address(addr) {
            return Err(ExecutionError::Abort(ExitCode::SYS_INVALID_RECEIVER));
        }
        let id = self.vm.state_tree.register_new_address(addr).or_fatal()?;
        let empty_state = self
            .vm
            .state_tree
            .store()
            .put_cbor(&[(); 0], Code::Blake2b256)
            .or_fatal()?;
        self.vm.state_tree.set_actor_by_id(
            id,
            ActorState::new(
                *builtin::ACCOUNT_ACTOR_CODE,
                empty_state,
                TokenAmount::zero(),
                0,
            ),
        );
        let params = RawBytes::serialize(addr).or_fatal()?;
        self.send_with_revert(&InternalMessage {
            from: SYSTEM_ACTOR_ADDR,
            to: Address::new_id(id),
            value: TokenAmount::zero(),
            method: METHOD_CONSTRUCTOR,
            params,
        })?;
        self.vm
            .state_tree
            .get_actor_by_id(id)
            .or_fatal()?
            .context("freshly constructed account actor is missing")
            .or_fatal()
    }

    fn transfer(
        &mut self,
        from: ActorID,
        to: ActorID,
        value: &TokenAmount,
    ) -> Result<(), ExecutionError> {
        let mut from_actor = self
            .vm
            .state_tree
            .get_actor_by_id(from)
            .or_fatal()?
            .ok_or(ExecutionError::Abort(ExitCode::SYS_SENDER_INVALID))?;
        if &from_actor.balance < value {
            return Err(ExecutionError::Abort(ExitCode::SYS_INSUFFICIENT_FUNDS));
        }
        from_actor.deduct_funds(value).or_fatal()?;
        let mut to_actor = self
            .vm
            .state_tree
            .get_actor_by_id(to)
            .or_fatal()?
            .ok_or(ExecutionError::Abort(ExitCode::SYS_INVALID_RECEIVER))?;
        to_actor.deposit_funds(value);
        self.vm.state_tree.set_actor_by_id(from, from_actor);
        self.vm.state_tree.set_actor_by_id(to, to_actor);
        Ok(())
    }
}

/// Gas-charging view over the block store; every actor state access pays
/// for itself.
pub struct ChargingBlockstore<'a, BS> {
    inner: &'a BS,
    gas: &'a GasTracker,
    price_list: &'static PriceList,
}

impl<'a, BS: Blockstore> Blockstore for ChargingBlockstore<'a, BS> {
    fn get(&self, k: &Cid) -> anyhow::Result<Option<Vec<u8>>> {
        self.gas
            .charge(self.price_list.on_ipld_get())
            .map_err(anyhow::Error::from)?;
        self.inner.get(k)
    }

    fn put_keyed(&self, k: &Cid, block: &[u8]) -> anyhow::Result<()> {
        self.gas
            .charge(self.price_list.on_ipld_put(block.len()))
            .map_err(anyhow::Error::from)?;
        self.inner.put_keyed(k, block)
    }

    fn has(&self, k: &Cid) -> anyhow::Result<bool> {
        self.inner.has(k)
    }
}

/// The world as one actor invocation sees it.
pub struct InvocationRuntime<'a, 'vm, DB: Blockstore> {
    call: &'a mut CallManager<'vm, DB>,
    caller: ActorID,
    receiver: ActorID,
    value_received: TokenAmount,
    method: MethodNum,
}

impl<'a, 'vm, DB: Blockstore> InvocationRuntime<'a, 'vm, DB> {
    pub fn epoch(&self) -> ChainEpoch {
        self.call.vm.epoch
    }

    pub fn network_version(&self) -> NetworkVersion {
        self.call.vm.network_version
    }

    pub fn caller(&self) -> ActorID {
        self.caller
    }

    pub fn receiver(&self) -> ActorID {
        self.receiver
    }

    pub fn value_received(&self) -> &TokenAmount {
        &self.value_received
    }

    pub fn method(&self) -> MethodNum {
        self.method
    }

    pub fn charge_gas(&mut self, charge: GasCharge) -> Result<(), ExecutionError> {
        self.call.gas.charge(charge)
    }

    /// Gas-charging store for the actor's own IPLD data.
    pub fn store(&self) -> ChargingBlockstore<'_, BufferedBlockstore<DB>> {
        ChargingBlockstore {
            inner: self.call.vm.state_tree.store(),
            gas: &self.call.gas,
            price_list: self.call.vm.price_list,
        }
    }

    pub fn chain_randomness(
        &self,
        pers: i64,
        round: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; 32], ExecutionError> {
        self.call
            .vm
            .rand
            .get_chain_randomness(pers, round, entropy)
            .or_fatal()
    }

    pub fn beacon_randomness(
        &self,
        pers: i64,
        round: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; 32], ExecutionError> {
        self.call
            .vm
            .rand
            .get_beacon_randomness(pers, round, entropy)
            .or_fatal()
    }

    pub fn resolve_address(&mut self, addr: &Address) -> Result<Option<ActorID>, ExecutionError> {
        self.call.vm.state_tree.lookup_id(addr).or_fatal()
    }

    pub fn current_balance(&mut self) -> Result<TokenAmount, ExecutionError> {
        Ok(self
            .call
            .vm
            .state_tree
            .get_actor_by_id(self.receiver)
            .or_fatal()?
            .map(|a| a.balance)
            .unwrap_or_else(TokenAmount::zero))
    }

    /// Reads the receiver's state object through the charging store.
    pub fn state<T: DeserializeOwned>(&mut self) -> Result<T, ExecutionError> {
        let head = self
            .call
            .vm
            .state_tree
            .get_actor_by_id(self.receiver)
            .or_fatal()?
            .context("receiver actor is missing")
            .or_fatal()?
            .state;
        self.store()
            .get_cbor(&head)
            .or_fatal()?
            .context("actor state object is missing")
            .or_fatal()
    }

    /// Replaces the receiver's state object.
    pub fn set_state<T: Serialize>(&mut self, state: &T) -> Result<(), ExecutionError> {
        let head = self.store().put_cbor(state, Code::Blake2b256).or_fatal()?;
        let mut actor = self
            .call
            .vm
            .state_tree
            .get_actor_by_id(self.receiver)
            .or_fatal()?
            .context("receiver actor is missing")
            .or_fatal()?;
        actor.state = head;
        self.call.vm.state_tree.set_actor_by_id(self.receiver, actor);
        Ok(())
    }

    /// Sends a nested message from the receiver; runs in its own
    /// transaction, completing before this invocation resumes.
    pub fn send(
        &mut self,
        to: &Address,
        method: MethodNum,
        params: RawBytes,
        value: TokenAmount,
    ) -> Result<RawBytes, ExecutionError> {
        let msg = InternalMessage {
            from: Address::new_id(self.receiver),
            to: *to,
            value,
            method,
            params,
        };
        self.call.send_with_revert(&msg)
    }
}
