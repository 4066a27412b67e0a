//! Deterministic gas cost model with a periodically retargeted ceiling.

use crate::errors::{ChainError, ChainResult};
use crate::types::unix_time;

pub const BASE_GAS: u64 = 8_000;
pub const BYTES_COST: u64 = 20;
pub const PAYLOAD_BYTE_COST: u64 = 32;
pub const VALUE_BIT_COST: u64 = 16;
pub const MIN_TIP_PER_GAS: u64 = 5;

pub const GAS_DIVISOR: u64 = 10_000;
pub const MAX_GAS_MULTIPLIER: u64 = 6_000;
pub const MIN_GAS_MULTIPLIER: u64 = 500;
pub const GAS_TIP_MULTIPLIER: u64 = 1_000;
pub const GAS_REFACTOR: u64 = 3_000;

pub const DEFAULT_GAS_TARGET: u64 = 1_000_000;
pub const DEFAULT_MAX_GAS_TARGET: u64 = DEFAULT_GAS_TARGET + MAX_GAS_MULTIPLIER * GAS_DIVISOR;
pub const DEFAULT_GAS_INTERVAL: u64 = 60;

fn gas_tip_for(cost: u64) -> u64 {
    cost * GAS_TIP_MULTIPLIER / GAS_DIVISOR
}

/// Computes `(gas_cost, gas_tip)` for a transaction.
///
/// `tip_gas` is the caller's requested tip: zero means "charge the exact
/// tip", anything below the exact tip is honored as-is, anything above it
/// is rejected. The final cost is clamped to `[gas_price, gas_target]`,
/// rejecting on the high side.
pub fn calc_gas_cost(
    gas_target: u64,
    gas_price: u64,
    data_len: usize,
    payload_len: usize,
    value_bits: usize,
    tip_gas: u64,
) -> ChainResult<(u64, u64)> {
    let mut cost = BASE_GAS
        + BYTES_COST * data_len as u64
        + PAYLOAD_BYTE_COST * payload_len as u64
        + if value_bits > 0 {
            VALUE_BIT_COST * value_bits as u64
        } else {
            0
        };

    let mut tip = gas_tip_for(cost);
    if tip_gas > tip {
        return Err(ChainError::Transaction(format!(
            "gas tip {tip_gas} exceeds the exact tip {tip}"
        )));
    }
    if tip_gas > 0 && tip_gas < tip {
        tip = tip_gas;
    }
    cost += tip;

    if cost > gas_target {
        return Err(ChainError::Transaction(format!(
            "gas cost {cost} exceeds target {gas_target}"
        )));
    }
    if cost < gas_price {
        cost = gas_price;
    }

    Ok((cost, tip))
}

/// Owns the chain-wide gas ceiling and floor and retargets them on an
/// interval from the latest committed gas target.
#[derive(Clone, Debug)]
pub struct GasPool {
    gas_target: u64,
    gas_price: u64,
    max_gas_target: u64,
    gas_interval: u64,
    latest_sync: u64,
}

impl Default for GasPool {
    fn default() -> Self {
        Self::new()
    }
}

impl GasPool {
    pub fn new() -> Self {
        Self {
            gas_target: DEFAULT_GAS_TARGET,
            gas_price: 0,
            max_gas_target: DEFAULT_MAX_GAS_TARGET,
            gas_interval: DEFAULT_GAS_INTERVAL,
            latest_sync: unix_time(),
        }
    }

    pub fn gas_target(&self) -> u64 {
        self.gas_target
    }

    pub fn gas_price(&self) -> u64 {
        self.gas_price
    }

    pub fn max_gas_target(&self) -> u64 {
        self.max_gas_target
    }

    pub fn calc_gas(
        &self,
        data_len: usize,
        payload_len: usize,
        value_bits: usize,
        tip_gas: u64,
    ) -> ChainResult<(u64, u64)> {
        calc_gas_cost(
            self.gas_target,
            self.gas_price,
            data_len,
            payload_len,
            value_bits,
            tip_gas,
        )
    }

    /// Retargets ceiling and floor once the interval has elapsed: removes
    /// the 10% tip share, reapplies the 30% refactor, then derives the 5%
    /// floor and 60% ceiling from the new target.
    pub fn sync(&mut self, latest_gas_target: u64) -> ChainResult<()> {
        if latest_gas_target > self.max_gas_target {
            return Err(ChainError::Transaction(format!(
                "gas target {latest_gas_target} exceeds maximum {}",
                self.max_gas_target
            )));
        }

        if !self.expired() {
            return Ok(());
        }

        let total_tip = latest_gas_target / GAS_DIVISOR * GAS_TIP_MULTIPLIER;
        let without_tip = latest_gas_target - total_tip;
        let refactor = without_tip * GAS_REFACTOR / GAS_DIVISOR;
        let gas_target = without_tip + refactor;

        self.gas_price = gas_target / GAS_DIVISOR * MIN_GAS_MULTIPLIER;
        self.max_gas_target = gas_target * MAX_GAS_MULTIPLIER / GAS_DIVISOR;
        self.gas_target = gas_target;
        self.latest_sync = unix_time();

        Ok(())
    }

    fn expired(&self) -> bool {
        self.latest_sync <= unix_time().saturating_sub(self.gas_interval)
    }

    #[cfg(test)]
    fn force_expiry(&mut self) {
        self.latest_sync = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_cost_with_exact_tip() {
        let (cost, tip) = calc_gas_cost(DEFAULT_GAS_TARGET, 0, 0, 0, 0, 0).unwrap();
        assert_eq!(tip, BASE_GAS * GAS_TIP_MULTIPLIER / GAS_DIVISOR);
        assert_eq!(cost, BASE_GAS + tip);
    }

    #[test]
    fn per_byte_and_per_bit_components() {
        let (cost, _) = calc_gas_cost(DEFAULT_GAS_TARGET, 0, 10, 4, 16, 0).unwrap();
        let raw = BASE_GAS + BYTES_COST * 10 + PAYLOAD_BYTE_COST * 4 + VALUE_BIT_COST * 16;
        assert_eq!(cost, raw + gas_tip_for(raw));
    }

    #[test]
    fn zero_value_skips_value_cost() {
        let (with_value, _) = calc_gas_cost(DEFAULT_GAS_TARGET, 0, 0, 0, 1, 0).unwrap();
        let (without_value, _) = calc_gas_cost(DEFAULT_GAS_TARGET, 0, 0, 0, 0, 0).unwrap();
        assert!(with_value > without_value);
    }

    #[test]
    fn over_tip_is_rejected() {
        let exact = gas_tip_for(BASE_GAS);
        let err = calc_gas_cost(DEFAULT_GAS_TARGET, 0, 0, 0, 0, exact + 1).unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[test]
    fn smaller_tip_is_honored() {
        let (cost, tip) = calc_gas_cost(DEFAULT_GAS_TARGET, 0, 0, 0, 0, 3).unwrap();
        assert_eq!(tip, 3);
        assert_eq!(cost, BASE_GAS + 3);
    }

    #[test]
    fn over_target_is_rejected() {
        let err = calc_gas_cost(100, 0, 0, 0, 0, 0).unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[test]
    fn floor_applies_below_gas_price() {
        let (cost, _) = calc_gas_cost(DEFAULT_GAS_TARGET, 50_000, 0, 0, 0, 0).unwrap();
        assert_eq!(cost, 50_000);
    }

    #[test]
    fn retarget_shifts_target_floor_and_ceiling() {
        let mut pool = GasPool::new();
        pool.force_expiry();
        pool.sync(DEFAULT_GAS_TARGET).unwrap();

        let total_tip = DEFAULT_GAS_TARGET / GAS_DIVISOR * GAS_TIP_MULTIPLIER;
        let without_tip = DEFAULT_GAS_TARGET - total_tip;
        let expected_target = without_tip + without_tip * GAS_REFACTOR / GAS_DIVISOR;
        assert_eq!(pool.gas_target(), expected_target);
        assert_eq!(
            pool.gas_price(),
            expected_target / GAS_DIVISOR * MIN_GAS_MULTIPLIER
        );
        assert_eq!(
            pool.max_gas_target(),
            expected_target * MAX_GAS_MULTIPLIER / GAS_DIVISOR
        );
    }

    #[test]
    fn retarget_rejects_target_above_ceiling() {
        let mut pool = GasPool::new();
        pool.force_expiry();
        let err = pool.sync(pool.max_gas_target() + 1).unwrap_err();
        assert!(matches!(err, ChainError::Transaction(_)));
    }

    #[test]
    fn retarget_is_a_noop_before_expiry() {
        let mut pool = GasPool::new();
        let before = pool.gas_target();
        pool.sync(DEFAULT_GAS_TARGET).unwrap();
        assert_eq!(pool.gas_target(), before);
    }
}
