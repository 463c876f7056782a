//! Position metrics.
//!
//! Pure display metrics for a leveraged position: size, net APY and health
//! factor. Recomputed on every input change; none of them gate the loop.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Market parameters
// ---------------------------------------------------------------------------

/// Rates and risk parameters of the market being looped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketParams {
    /// Staking yield, percent.
    pub base_apy: Decimal,
    /// Borrow rate, percent.
    pub borrow_cost: Decimal,
    /// Inverse of the liquidation threshold.
    pub max_ltv_inverse: Decimal,
    pub max_ltv_pct: Decimal,
    pub liquidation_fee_pct: Decimal,
}

impl Default for MarketParams {
    fn default() -> Self {
        Self {
            base_apy: dec!(4.5),
            borrow_cost: dec!(2.1),
            max_ltv_inverse: dec!(4),
            max_ltv_pct: dec!(95),
            liquidation_fee_pct: dec!(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Health band
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBand {
    Healthy,
    Caution,
    AtRisk,
}

impl HealthBand {
    pub fn from_factor(health_factor: Decimal) -> Self {
        if health_factor >= dec!(2) {
            HealthBand::Healthy
        } else if health_factor >= dec!(1.5) {
            HealthBand::Caution
        } else {
            HealthBand::AtRisk
        }
    }
}

impl fmt::Display for HealthBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthBand::Healthy => write!(f, "🟢 HEALTHY"),
            HealthBand::Caution => write!(f, "🟡 CAUTION"),
            HealthBand::AtRisk => write!(f, "🔴 AT RISK"),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

pub fn position_size(principal: Decimal, leverage: Decimal) -> Decimal {
    principal * leverage
}

/// `base_apy × L − borrow_cost × (L − 1)`, in percent.
pub fn net_apy(params: &MarketParams, leverage: Decimal) -> Decimal {
    params.base_apy * leverage - params.borrow_cost * (leverage - Decimal::ONE)
}

/// `max_ltv_inverse / L`. Zero leverage is treated as 1x.
pub fn health_factor(params: &MarketParams, leverage: Decimal) -> Decimal {
    if leverage <= Decimal::ZERO {
        return params.max_ltv_inverse;
    }
    params.max_ltv_inverse / leverage
}

/// Fill fraction (0–1) of a health bar scaled to `max_ltv_inverse`.
pub fn health_bar_fill(params: &MarketParams, health_factor: Decimal) -> Decimal {
    if params.max_ltv_inverse <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (health_factor / params.max_ltv_inverse).min(Decimal::ONE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
