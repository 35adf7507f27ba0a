// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::Cell;

use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::{MethodNum, METHOD_SEND};
use num_traits::Zero;

use super::errors::ExecutionError;

/// Whole gas units.
pub type Gas = i64;

/// A named gas charge, split into compute and storage components the way
/// the pricelists specify them.
#[derive(Debug, Clone)]
pub struct GasCharge {
    pub name: &'static str,
    pub compute_gas: Gas,
    pub storage_gas: Gas,
}

impl GasCharge {
    pub fn new(name: &'static str, compute_gas: Gas, storage_gas: Gas) -> Self {
        GasCharge {
            name,
            compute_gas,
            storage_gas,
        }
    }

    pub fn total(&self) -> Gas {
        self.compute_gas + self.storage_gas
    }
}

/// Gas meter of one message application. Interior-mutable so the charging
/// IPLD view can meter reads through a shared reference; a single message
/// never races itself.
#[derive(Debug)]
pub struct GasTracker {
    gas_limit: Gas,
    gas_used: Cell<Gas>,
}

impl GasTracker {
    pub fn new(gas_limit: Gas) -> Self {
        GasTracker {
            gas_limit,
            gas_used: Cell::new(0),
        }
    }

    /// Applies a charge. Running past the limit pins `gas_used` at the
    /// limit and aborts with out-of-gas.
    pub fn charge(&self, charge: GasCharge) -> Result<(), ExecutionError> {
        let used = self.gas_used.get().saturating_add(charge.total());
        if used > self.gas_limit {
            self.gas_used.set(self.gas_limit);
            Err(ExecutionError::OutOfGas)
        } else {
            self.gas_used.set(used);
            Ok(())
        }
    }

    pub fn gas_used(&self) -> Gas {
        self.gas_used.get()
    }

    pub fn gas_limit(&self) -> Gas {
        self.gas_limit
    }
}

/// Gas prices for one network era.
pub struct PriceList {
    on_chain_message_compute_base: Gas,
    on_chain_message_storage_base: Gas,
    on_chain_message_storage_per_byte: Gas,
    on_chain_return_value_per_byte: Gas,
    storage_gas_multiplier: Gas,

    send_base: Gas,
    send_transfer_funds: Gas,
    send_transfer_only_premium: Gas,
    send_invoke_method: Gas,

    ipld_get_base: Gas,
    ipld_put_base: Gas,
    ipld_put_per_byte: Gas,

    create_actor_compute: Gas,
    create_actor_storage: Gas,
}

impl PriceList {
    /// Inclusion cost of a chain message of `size` encoded bytes.
    pub fn on_chain_message(&self, size: usize) -> GasCharge {
        GasCharge::new(
            "OnChainMessage",
            self.on_chain_message_compute_base,
            (self.on_chain_message_storage_base
                + self.on_chain_message_storage_per_byte * size as Gas)
                * self.storage_gas_multiplier,
        )
    }

    /// Cost of storing a message's return value on chain.
    pub fn on_chain_return_value(&self, size: usize) -> GasCharge {
        GasCharge::new(
            "OnChainReturnValue",
            0,
            size as Gas * self.on_chain_return_value_per_byte * self.storage_gas_multiplier,
        )
    }

    /// Invocation cost of a method, value transfer included.
    pub fn on_method_invocation(&self, value: &TokenAmount, method: MethodNum) -> GasCharge {
        let mut ret = self.send_base;
        if !value.is_zero() {
            ret += self.send_transfer_funds;
            if method == METHOD_SEND {
                ret += self.send_transfer_only_premium;
            }
        }
        if method != METHOD_SEND {
            ret += self.send_invoke_method;
        }
        GasCharge::new("OnMethodInvocation", ret, 0)
    }

    pub fn on_ipld_get(&self) -> GasCharge {
        GasCharge::new("OnIpldGet", self.ipld_get_base, 0)
    }

    pub fn on_ipld_put(&self, size: usize) -> GasCharge {
        GasCharge::new(
            "OnIpldPut",
            self.ipld_put_base,
            size as Gas * self.ipld_put_per_byte * self.storage_gas_multiplier,
        )
    }

    pub fn on_create_actor(&self) -> GasCharge {
        GasCharge::new(
            "OnCreateActor",
            self.create_actor_compute,
            self.create_actor_storage * self.storage_gas_multiplier,
        )
    }
}

const BASE_PRICES: PriceList = PriceList {
    on_chain_message_compute_base: 38863,
    on_chain_message_storage_base: 36,
    on_chain_message_storage_per_byte: 1,
    on_chain_return_value_per_byte: 1,
    storage_gas_multiplier: 1300,

    send_base: 29233,
    send_transfer_funds: 27500,
    send_transfer_only_premium: 159672,
    send_invoke_method: -5377,

    ipld_get_base: 75242,
    ipld_put_base: 84070,
    ipld_put_per_byte: 1,

    create_actor_compute: 1108454,
    create_actor_storage: 36 + 40,
};

/// Calico repriced IPLD reads; everything else carried over.
const CALICO_PRICES: PriceList = PriceList {
    ipld_get_base: 114617,
    ..BASE_PRICES
};

/// Epoch of the Calico upgrade, the only repricing era this engine
/// distinguishes.
const UPGRADE_CALICO_HEIGHT: ChainEpoch = 265_200;

/// Pricelist in force at `epoch`.
pub fn price_list_by_epoch(epoch: ChainEpoch) -> &'static PriceList {
    if epoch < UPGRADE_CALICO_HEIGHT {
        &BASE_PRICES
    } else {
        &CALICO_PRICES
    }
}

/// Gas settlement of one message: how the prepaid gas reserve splits into
/// burns, the miner tip and the sender refund. All computed in atto with
/// truncating division.
#[derive(Clone, Default)]
pub struct GasOutputs {
    pub base_fee_burn: TokenAmount,
    pub over_estimation_burn: TokenAmount,
    pub miner_penalty: TokenAmount,
    pub miner_tip: TokenAmount,
    pub refund: TokenAmount,

    pub gas_refund: u64,
    pub gas_burned: u64,
}

impl GasOutputs {
    pub fn compute(
        gas_used: u64,
        gas_limit: u64,
        base_fee: &TokenAmount,
        fee_cap: &TokenAmount,
        gas_premium: &TokenAmount,
    ) -> Self {
        let mut out = GasOutputs::default();

        let mut base_fee_to_pay = base_fee;
        if base_fee > fee_cap {
            base_fee_to_pay = fee_cap;
            out.miner_penalty = TokenAmount::from_atto((base_fee.atto() - fee_cap.atto()) * gas_used);
        }

        out.base_fee_burn = TokenAmount::from_atto(base_fee_to_pay.atto() * gas_used);

        let mut miner_tip = gas_premium.clone();
        if base_fee_to_pay.atto() + miner_tip.atto() > *fee_cap.atto() {
            miner_tip = TokenAmount::from_atto(fee_cap.atto() - base_fee_to_pay.atto());
        }
        out.miner_tip = TokenAmount::from_atto(miner_tip.atto() * gas_limit);

        let (gas_refund, gas_burned) = compute_gas_overestimation_burn(gas_used, gas_limit);
        out.gas_refund = gas_refund;
        out.gas_burned = gas_burned;

        if out.gas_burned != 0 {
            out.over_estimation_burn =
                TokenAmount::from_atto(base_fee_to_pay.atto() * out.gas_burned);
            out.miner_penalty += TokenAmount::from_atto(
                (base_fee.atto() - base_fee_to_pay.atto()) * out.gas_burned,
            );
        }
        let required_funds = TokenAmount::from_atto(fee_cap.atto() * gas_limit);
        out.refund =
            required_funds - &out.base_fee_burn - &out.miner_tip - &out.over_estimation_burn;

        out
    }
}

/// Burns the unused slack beyond a 10% overestimation headroom:
/// `over = gas_limit - 11 * gas_used / 10`, burn
/// `(gas_limit - gas_used) * min(gas_used, over) / gas_used`.
fn compute_gas_overestimation_burn(gas_used: u64, gas_limit: u64) -> (u64, u64) {
    const GAS_OVERUSE_NUM: u128 = 11;
    const GAS_OVERUSE_DENOM: u128 = 10;

    if gas_used == 0 {
        return (0, gas_limit);
    }

    let gas_used = gas_used as u128;
    let gas_limit = gas_limit as u128;

    let over = gas_limit
        .saturating_sub((GAS_OVERUSE_NUM * gas_used) / GAS_OVERUSE_DENOM)
        .min(gas_used);
    let gas_remaining = gas_limit.saturating_sub(gas_used);
    let gas_to_burn = (gas_remaining * over) / gas_used;
    let refund = gas_remaining.saturating_sub(gas_to_burn);

    (refund as u64, gas_to_burn as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_pins_used_at_limit_on_overflow() {
        let tracker = GasTracker::new(100);
        tracker.charge(GasCharge::new("a", 60, 0)).unwrap();
        assert_eq!(tracker.gas_used(), 60);
        let err = tracker.charge(GasCharge::new("b", 41, 0)).unwrap_err();
        assert!(matches!(err, ExecutionError::OutOfGas));
        assert_eq!(tracker.gas_used(), 100);
    }

    #[test]
    fn outputs_sum_to_required_funds() {
        for (used, limit, base_fee, fee_cap, premium) in [
            (500u64, 1000u64, 100u64, 200u64, 5u64),
            (0, 1000, 100, 200, 5),
            (1000, 1000, 100, 200, 5),
            (10, 1000, 300, 200, 5),
            (910, 1000, 100, 200, 5),
        ] {
            let out = GasOutputs::compute(
                used,
                limit,
                &TokenAmount::from_atto(base_fee),
                &TokenAmount::from_atto(fee_cap),
                &TokenAmount::from_atto(premium),
            );
            // Every atto of the prepaid reserve is accounted for.
            let total = &out.base_fee_burn + &out.miner_tip + &out.over_estimation_burn + &out.refund;
            assert_eq!(total, TokenAmount::from_atto(fee_cap * limit));
        }
    }

    #[test]
    fn high_base_fee_is_capped_and_penalized() {
        let out = GasOutputs::compute(
            100,
            100,
            &TokenAmount::from_atto(300),
            &TokenAmount::from_atto(200),
            &TokenAmount::from_atto(5),
        );
        assert_eq!(out.base_fee_burn, TokenAmount::from_atto(200 * 100));
        assert_eq!(out.miner_penalty, TokenAmount::from_atto(100 * 100));
    }

    #[test]
    fn overestimation_burn_boundaries() {
        // Using everything burns nothing extra.
        assert_eq!(compute_gas_overestimation_burn(1000, 1000), (0, 0));
        // Within the 10% headroom burns nothing.
        assert_eq!(compute_gas_overestimation_burn(910, 1000), (90, 0));
        // Unused messages burn the whole limit.
        assert_eq!(compute_gas_overestimation_burn(0, 1000), (0, 1000));
        // Deep overestimation burns part of the remainder.
        let (refund, burned) = compute_gas_overestimation_burn(100, 1000);
        assert_eq!(burned, (900 * 100) / 100);
        assert_eq!(refund, 900 - burned);
    }
}
