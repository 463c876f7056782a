//! Gas estimation.
//!
//! Sums the gas limit of every transaction the planner would submit for a
//! request, skipping approvals already in place, and prices it at the
//! current network gas price.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::engine::planner::{self, GasLimits};
use crate::types::{ApprovalState, LoopRequest};

const GWEI_PER_NATIVE: Decimal = dec!(1000000000);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GasEstimate {
    pub transactions: usize,
    pub gas_units: u64,
    pub gas_price_gwei: Decimal,
    /// Cost in the chain's native currency.
    pub cost_native: Decimal,
}

/// Estimate the gas cost of a full run.
pub fn estimate(
    request: &LoopRequest,
    approvals: &ApprovalState,
    limits: &GasLimits,
    gas_price_gwei: Decimal,
) -> GasEstimate {
    let steps = planner::plan(request, approvals);
    let gas_units: u64 = steps.iter().map(|s| limits.for_kind(s.kind)).sum();
    GasEstimate {
        transactions: steps.len(),
        gas_units,
        gas_price_gwei,
        cost_native: Decimal::from(gas_units) * gas_price_gwei / GWEI_PER_NATIVE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_matches_formula() {
        let limits = GasLimits::default();
        let req = LoopRequest::new(dec!(1000), dec!(3), dec!(0.8));
        let est = estimate(&req, &ApprovalState::none(), &limits, dec!(20));

        let expected = 3 * limits.approve
            + 3 * (limits.mint + limits.stake)
            + limits.open_position
            + 2 * limits.augment_position;
        assert_eq!(est.gas_units, expected);
        assert_eq!(est.transactions, 3 + 9);
        assert_eq!(
            est.cost_native,
            Decimal::from(expected) * dec!(20) / dec!(1000000000)
        );
    }

    #[test]
    fn test_granted_approvals_reduce_gas() {
        let limits = GasLimits::default();
        let req = LoopRequest::new(dec!(1000), dec!(2), dec!(0.8));
        let full = estimate(&req, &ApprovalState::none(), &limits, dec!(10));
        let skipped = estimate(&req, &ApprovalState::all(), &limits, dec!(10));
        assert_eq!(full.gas_units - skipped.gas_units, 3 * limits.approve);
        assert_eq!(full.transactions - skipped.transactions, 3);
    }
}
