//! Transaction planner.
//!
//! Pure functions that decide which step follows which, and what
//! transaction a step submits. Everything here is a function of
//! `(step, iteration, carry, request)` plus static configuration, so the
//! orchestrator and the gas estimator agree on the exact sequence.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{
    Address, AllowanceAmount, ApprovalState, CallKind, ContractCall, LoopRequest, LoopStep,
    PositionId, TxRequest,
};

/// Decimal places kept on computed amounts (18-decimal tokens).
pub const AMOUNT_DP: u32 = 18;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How much an approval step grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPolicy {
    /// One max approval that covers every future run.
    #[default]
    Unlimited,
    /// Exactly what this run will transfer across all iterations.
    Exact,
}

/// Contract addresses the loop talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contracts {
    pub base_token: Address,
    pub yield_token: Address,
    pub minter: Address,
    /// Staking vault; its shares are the collateral token.
    pub staking_vault: Address,
    pub lending_market: Address,
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            base_token: Address::from("0xbase"),
            yield_token: Address::from("0xyield"),
            minter: Address::from("0xminter"),
            staking_vault: Address::from("0xvault"),
            lending_market: Address::from("0xmarket"),
        }
    }
}

/// Gas limit per operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasLimits {
    pub approve: u64,
    pub mint: u64,
    pub stake: u64,
    pub open_position: u64,
    pub augment_position: u64,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            approve: 46_000,
            mint: 180_000,
            stake: 120_000,
            open_position: 420_000,
            augment_position: 300_000,
        }
    }
}

impl GasLimits {
    pub fn for_kind(&self, kind: CallKind) -> u64 {
        match kind {
            CallKind::Approve => self.approve,
            CallKind::Mint => self.mint,
            CallKind::Stake => self.stake,
            CallKind::OpenPosition => self.open_position,
            CallKind::AugmentPosition => self.augment_position,
        }
    }
}

/// Static loop configuration shared by the planner and orchestrator.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub contracts: Contracts,
    pub gas: GasLimits,
    pub approval_policy: ApprovalPolicy,
    pub unlimited_threshold: Decimal,
    pub max_leverage: Decimal,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            contracts: Contracts::default(),
            gas: GasLimits::default(),
            approval_policy: ApprovalPolicy::Unlimited,
            unlimited_threshold: dec!(1000000000000),
            max_leverage: dec!(5),
        }
    }
}

impl LoopConfig {
    /// Allowance at or above which an approval step is skipped for this run.
    pub fn required_allowance(&self, request: &LoopRequest) -> Decimal {
        match self.approval_policy {
            ApprovalPolicy::Unlimited => self.unlimited_threshold,
            ApprovalPolicy::Exact => run_total(request),
        }
    }

    /// Derive approval state from the three on-chain allowances.
    pub fn approvals_from(
        &self,
        request: &LoopRequest,
        base: Decimal,
        yield_token: Decimal,
        collateral: Decimal,
    ) -> ApprovalState {
        let needed = self.required_allowance(request);
        ApprovalState {
            base: base >= needed,
            yield_token: yield_token >= needed,
            collateral: collateral >= needed,
        }
    }
}

// ---------------------------------------------------------------------------
// Step progression
// ---------------------------------------------------------------------------

/// The step a fresh run starts in.
pub fn first_step(approvals: &ApprovalState) -> LoopStep {
    if approvals.base {
        LoopStep::DepositBase
    } else {
        LoopStep::ApproveBase
    }
}

/// The step entered after `step` confirms during `iteration` of `total`.
///
/// Yield-token and collateral approvals are only considered on the first
/// iteration; a granted approval covers the rest of the run. Leaving
/// `BorrowBase` for `DepositBase` implies the iteration advances.
pub fn step_after(
    step: LoopStep,
    iteration: u32,
    total: u32,
    approvals: &ApprovalState,
) -> LoopStep {
    match step {
        LoopStep::ApproveBase => LoopStep::DepositBase,
        LoopStep::DepositBase => {
            if iteration == 1 && !approvals.yield_token {
                LoopStep::ApproveYieldToken
            } else {
                LoopStep::DepositYieldToken
            }
        }
        LoopStep::ApproveYieldToken => LoopStep::DepositYieldToken,
        LoopStep::DepositYieldToken => {
            if iteration == 1 && !approvals.collateral {
                LoopStep::ApproveCollateral
            } else {
                LoopStep::BorrowBase
            }
        }
        LoopStep::ApproveCollateral => LoopStep::BorrowBase,
        LoopStep::BorrowBase => {
            if iteration < total {
                LoopStep::DepositBase
            } else {
                LoopStep::Complete
            }
        }
        LoopStep::Idle | LoopStep::Complete => step,
    }
}

/// Amount borrowed against `carry` in one iteration.
pub fn borrow_amount(carry: Decimal, borrow_ratio: Decimal) -> Decimal {
    (carry * borrow_ratio).round_dp(AMOUNT_DP)
}

/// Carry of each iteration, advanced with the same rounding the
/// orchestrator applies after every confirmed borrow.
pub fn carries(request: &LoopRequest) -> impl Iterator<Item = Decimal> + '_ {
    std::iter::successors(Some(request.principal), |carry| {
        Some(borrow_amount(*carry, request.borrow_ratio))
    })
    .take(request.iterations() as usize)
}

/// Sum of carries over every iteration: the total each token contract
/// transfers during the run.
pub fn run_total(request: &LoopRequest) -> Decimal {
    carries(request).sum()
}

/// Total base borrowed across the whole run.
pub fn total_borrowed(request: &LoopRequest) -> Decimal {
    carries(request)
        .map(|carry| borrow_amount(carry, request.borrow_ratio))
        .sum()
}

// ---------------------------------------------------------------------------
// Transaction construction
// ---------------------------------------------------------------------------

/// Inputs for building the transaction a step submits.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub step: LoopStep,
    pub iteration: u32,
    pub carry: Decimal,
    pub request: &'a LoopRequest,
    pub account: &'a Address,
    /// Position opened by the first borrow. Markets that key positions by
    /// borrower report none, and the account identifies the position.
    pub position: Option<&'a PositionId>,
}

/// Build the transaction for a step. `Idle` and `Complete` submit nothing.
pub fn build_tx(config: &LoopConfig, ctx: &StepContext<'_>) -> Option<TxRequest> {
    let c = &config.contracts;
    let approve_amount = match config.approval_policy {
        ApprovalPolicy::Unlimited => AllowanceAmount::Unlimited,
        ApprovalPolicy::Exact => AllowanceAmount::Exact(run_total(ctx.request)),
    };

    let (target, call) = match ctx.step {
        LoopStep::Idle | LoopStep::Complete => return None,
        LoopStep::ApproveBase => (
            c.base_token.clone(),
            ContractCall::Approve {
                spender: c.minter.clone(),
                amount: approve_amount,
            },
        ),
        LoopStep::DepositBase => (c.minter.clone(), ContractCall::Mint { amount: ctx.carry }),
        LoopStep::ApproveYieldToken => (
            c.yield_token.clone(),
            ContractCall::Approve {
                spender: c.staking_vault.clone(),
                amount: approve_amount,
            },
        ),
        LoopStep::DepositYieldToken => (
            c.staking_vault.clone(),
            ContractCall::Stake { amount: ctx.carry },
        ),
        LoopStep::ApproveCollateral => (
            c.staking_vault.clone(),
            ContractCall::Approve {
                spender: c.lending_market.clone(),
                amount: approve_amount,
            },
        ),
        LoopStep::BorrowBase => {
            let borrow = borrow_amount(ctx.carry, ctx.request.borrow_ratio);
            let call = if ctx.iteration == 1 {
                ContractCall::OpenPosition {
                    collateral: ctx.carry,
                    borrow,
                    receiver: ctx.account.clone(),
                }
            } else {
                ContractCall::AugmentPosition {
                    position: ctx
                        .position
                        .cloned()
                        .unwrap_or_else(|| PositionId::for_borrower(ctx.account)),
                    collateral: ctx.carry,
                    borrow,
                }
            };
            (c.lending_market.clone(), call)
        }
    };

    let gas_limit = Some(config.gas.for_kind(call.kind()));
    Some(TxRequest {
        target,
        call,
        gas_limit,
    })
}

// ---------------------------------------------------------------------------
// Whole-run plan
// ---------------------------------------------------------------------------

/// One entry of a precomputed run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub step: LoopStep,
    pub iteration: u32,
    pub carry: Decimal,
    pub kind: CallKind,
}

/// Every step a run will take if each transaction confirms.
pub fn plan(request: &LoopRequest, approvals: &ApprovalState) -> Vec<PlannedStep> {
    let total = request.iterations();
    let mut steps = Vec::new();
    let mut step = first_step(approvals);
    let mut iteration = 1;
    let mut carry = request.principal;

    while step != LoopStep::Complete {
        let kind = match step {
            s if s.is_approval() => CallKind::Approve,
            LoopStep::DepositBase => CallKind::Mint,
            LoopStep::DepositYieldToken => CallKind::Stake,
            LoopStep::BorrowBase if iteration == 1 => CallKind::OpenPosition,
            LoopStep::BorrowBase => CallKind::AugmentPosition,
            _ => break,
        };
        steps.push(PlannedStep {
            step,
            iteration,
            carry,
            kind,
        });

        let next = step_after(step, iteration, total, approvals);
        if step == LoopStep::BorrowBase && next == LoopStep::DepositBase {
            iteration += 1;
            carry = borrow_amount(carry, request.borrow_ratio);
        }
        step = next;
    }
    steps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
