//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! The wallet account is referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;

use crate::engine::planner::{ApprovalPolicy, Contracts, GasLimits, LoopConfig};
use crate::strategy::metrics::MarketParams;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    #[serde(rename = "loop")]
    pub loop_params: LoopParamsConfig,
    pub market: MarketConfig,
    pub gas: GasConfig,
    pub contracts: Contracts,
    pub dashboard: DashboardConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Symbol of the base stablecoin, for display only.
    pub base_symbol: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoopParamsConfig {
    pub borrow_ratio: Decimal,
    pub max_leverage: Decimal,
    #[serde(default)]
    pub approval_policy: ApprovalPolicy,
    /// Allowance at or above which an unlimited approval counts as granted.
    pub unlimited_threshold: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    /// Yield on the staked token, in percent.
    pub base_apy: Decimal,
    /// Borrow rate on the lending market, in percent.
    pub borrow_cost: Decimal,
    /// Inverse of the liquidation threshold (4 means 25%).
    pub max_ltv_inverse: Decimal,
    pub max_ltv_pct: Decimal,
    pub liquidation_fee_pct: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GasConfig {
    pub limits: GasLimits,
    /// Used when the chain reader cannot supply a live price.
    pub fallback_price_gwei: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Parameters for the dry-run loop the binary executes on startup.
#[derive(Debug, Deserialize, Clone)]
pub struct DemoConfig {
    pub enabled: bool,
    pub account_env: String,
    pub default_account: String,
    pub principal: Decimal,
    pub leverage: Decimal,
    /// Base balance credited to the simulated account.
    pub initial_balance: Decimal,
    #[serde(default)]
    pub block_time_ms: u64,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let ratio = self.loop_params.borrow_ratio;
        if ratio <= Decimal::ZERO || ratio >= Decimal::ONE {
            anyhow::bail!("loop.borrow_ratio must be in (0, 1), got {ratio}");
        }
        if self.loop_params.max_leverage < Decimal::ONE {
            anyhow::bail!(
                "loop.max_leverage must be at least 1, got {}",
                self.loop_params.max_leverage
            );
        }
        if self.market.max_ltv_inverse <= Decimal::ZERO {
            anyhow::bail!("market.max_ltv_inverse must be positive");
        }
        if self.demo.principal <= Decimal::ZERO {
            anyhow::bail!("demo.principal must be positive, got {}", self.demo.principal);
        }
        let leverage = self.demo.leverage;
        if leverage < Decimal::ONE || leverage > self.loop_params.max_leverage {
            anyhow::bail!(
                "demo.leverage must be between 1 and loop.max_leverage ({}), got {leverage}",
                self.loop_params.max_leverage
            );
        }
        Ok(())
    }

    /// Engine settings for the orchestrator.
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            contracts: self.contracts.clone(),
            gas: self.gas.limits,
            approval_policy: self.loop_params.approval_policy,
            unlimited_threshold: self.loop_params.unlimited_threshold,
            max_leverage: self.loop_params.max_leverage,
        }
    }

    pub fn market_params(&self) -> MarketParams {
        let m = &self.market;
        MarketParams {
            base_apy: m.base_apy,
            borrow_cost: m.borrow_cost,
            max_ltv_inverse: m.max_ltv_inverse,
            max_ltv_pct: m.max_ltv_pct,
            liquidation_fee_pct: m.liquidation_fee_pct,
        }
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
[agent]
name = "LOOPER-001"
base_symbol = "USDC"

[loop]
borrow_ratio = 0.80
max_leverage = 5.0
approval_policy = "unlimited"
unlimited_threshold = 1000000000000.0

[market]
base_apy = 4.5
borrow_cost = 2.1
max_ltv_inverse = 4.0
max_ltv_pct = 95.0
liquidation_fee_pct = 5.0

[gas]
fallback_price_gwei = 20.0

[gas.limits]
approve = 46000
mint = 180000
stake = 120000
open_position = 420000
augment_position = 300000

[contracts]
base_token = "0x00000000000000000000000000000000000000b1"
yield_token = "0x00000000000000000000000000000000000000b2"
minter = "0x00000000000000000000000000000000000000b3"
staking_vault = "0x00000000000000000000000000000000000000b4"
lending_market = "0x00000000000000000000000000000000000000b5"

[dashboard]
enabled = false
port = 3030

[demo]
enabled = true
account_env = "LOOPER_ACCOUNT"
default_account = "0x000000000000000000000000000000000000dEaD"
principal = 1000.0
leverage = 2.0
initial_balance = 5000.0
"#;
