//! Strategy preview: position metrics and gas estimate for a request.

pub mod gas;
pub mod metrics;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::engine::planner::{self, GasLimits};
use crate::types::{ApprovalState, LoopRequest};
use gas::GasEstimate;
use metrics::{HealthBand, MarketParams};

/// Everything the presentation layer shows before the user submits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionPreview {
    pub principal: Decimal,
    pub leverage: Decimal,
    pub position_size: Decimal,
    pub net_apy: Decimal,
    pub health_factor: Decimal,
    pub health_band: HealthBand,
    pub health_bar_fill: Decimal,
    pub iterations: u32,
    pub total_borrowed: Decimal,
    pub gas: GasEstimate,
    pub max_ltv_pct: Decimal,
    pub liquidation_fee_pct: Decimal,
    /// Wallet balance of the base token. Only known once a wallet is read.
    pub base_balance: Option<Decimal>,
}

/// Compute the preview for a request. Pure; safe to call while a run is in
/// flight.
pub fn preview(
    request: &LoopRequest,
    approvals: &ApprovalState,
    market: &MarketParams,
    limits: &GasLimits,
    gas_price_gwei: Decimal,
) -> PositionPreview {
    let health_factor = metrics::health_factor(market, request.leverage).round_dp(2);
    let preview = PositionPreview {
        principal: request.principal,
        leverage: request.leverage,
        position_size: metrics::position_size(request.principal, request.leverage),
        net_apy: metrics::net_apy(market, request.leverage),
        health_factor,
        health_band: HealthBand::from_factor(health_factor),
        health_bar_fill: metrics::health_bar_fill(market, health_factor),
        iterations: request.iterations(),
        total_borrowed: planner::total_borrowed(request),
        gas: gas::estimate(request, approvals, limits, gas_price_gwei),
        max_ltv_pct: market.max_ltv_pct,
        liquidation_fee_pct: market.liquidation_fee_pct,
        base_balance: None,
    };
    debug!(
        leverage = %request.leverage,
        size = format!("${:.2}", preview.position_size),
        net_apy = format!("{:.2}%", preview.net_apy),
        health = %preview.health_factor,
        "Preview computed"
    );
    preview
}
