//! Shared types for the LOOPER orchestrator.
//!
//! These types form the data model used across all modules: contract
//! addresses, loop requests, steps, transaction requests and the events
//! the chain collaborators report back. Engine, strategy and chain modules
//! depend on them without depending on each other.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Addresses & sessions
// ---------------------------------------------------------------------------

/// An account or contract address, kept as the checksummed hex string the
/// wallet hands us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(s: impl Into<String>) -> Self {
        Address(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

/// Wallet session as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Session {
    Connected(Address),
    Disconnected,
}

impl Session {
    /// The active account, if any.
    pub fn account(&self) -> Option<&Address> {
        match self {
            Session::Connected(a) => Some(a),
            Session::Disconnected => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loop request
// ---------------------------------------------------------------------------

/// User input for one loop run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRequest {
    /// Base stablecoin deposited by the user.
    pub principal: Decimal,
    /// Target leverage multiple (>= 1).
    pub leverage: Decimal,
    /// Fraction of collateral value borrowed per iteration.
    pub borrow_ratio: Decimal,
}

impl LoopRequest {
    pub fn new(principal: Decimal, leverage: Decimal, borrow_ratio: Decimal) -> Self {
        Self {
            principal,
            leverage,
            borrow_ratio,
        }
    }

    /// Number of deposit/borrow iterations the run performs.
    ///
    /// Fractional multiples round down so the iteration count never exceeds
    /// the target leverage. Always at least one.
    pub fn iterations(&self) -> u32 {
        let whole = self.leverage.floor();
        if whole < Decimal::ONE {
            return 1;
        }
        whole.to_u32().unwrap_or(u32::MAX)
    }
}

impl fmt::Display for LoopRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "${:.2} @ {}x (borrow ratio {:.0}%)",
            self.principal,
            self.leverage.normalize(),
            self.borrow_ratio * Decimal::ONE_HUNDRED,
        )
    }
}

// ---------------------------------------------------------------------------
// Steps & status
// ---------------------------------------------------------------------------

/// Position of a run in the loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopStep {
    Idle,
    ApproveBase,
    DepositBase,
    ApproveYieldToken,
    DepositYieldToken,
    ApproveCollateral,
    BorrowBase,
    Complete,
}

impl LoopStep {
    /// Whether this step grants an allowance.
    pub fn is_approval(&self) -> bool {
        matches!(
            self,
            LoopStep::ApproveBase | LoopStep::ApproveYieldToken | LoopStep::ApproveCollateral
        )
    }

    /// Progress label shown while the step's transaction is in flight.
    pub fn label(&self) -> &'static str {
        match self {
            LoopStep::Idle => "Ready",
            LoopStep::ApproveBase => "Approving base token...",
            LoopStep::DepositBase => "Minting yield token...",
            LoopStep::ApproveYieldToken => "Approving yield token...",
            LoopStep::DepositYieldToken => "Staking yield token...",
            LoopStep::ApproveCollateral => "Approving collateral...",
            LoopStep::BorrowBase => "Borrowing base token...",
            LoopStep::Complete => "Loop complete",
        }
    }
}

impl fmt::Display for LoopStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopStep::Idle => "idle",
            LoopStep::ApproveBase => "approve-base",
            LoopStep::DepositBase => "deposit-base",
            LoopStep::ApproveYieldToken => "approve-yield-token",
            LoopStep::DepositYieldToken => "deposit-yield-token",
            LoopStep::ApproveCollateral => "approve-collateral",
            LoopStep::BorrowBase => "borrow-base",
            LoopStep::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    None,
    Complete,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::None => write!(f, "in progress"),
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Whether each approval the loop needs is already in place on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApprovalState {
    /// Base token → minter.
    pub base: bool,
    /// Yield token → staking vault.
    pub yield_token: bool,
    /// Vault shares → lending market.
    pub collateral: bool,
}

impl ApprovalState {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            base: true,
            yield_token: true,
            collateral: true,
        }
    }

    /// Whether the approval step can be skipped. Non-approval steps are never
    /// satisfied.
    pub fn satisfies(&self, step: LoopStep) -> bool {
        match step {
            LoopStep::ApproveBase => self.base,
            LoopStep::ApproveYieldToken => self.yield_token,
            LoopStep::ApproveCollateral => self.collateral,
            _ => false,
        }
    }

    /// Number of approval transactions still required.
    pub fn pending_count(&self) -> u32 {
        [self.base, self.yield_token, self.collateral]
            .iter()
            .filter(|ok| !**ok)
            .count() as u32
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// Amount granted by an approval transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowanceAmount {
    Unlimited,
    Exact(Decimal),
}

impl fmt::Display for AllowanceAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllowanceAmount::Unlimited => write!(f, "unlimited"),
            AllowanceAmount::Exact(a) => write!(f, "{a:.2}"),
        }
    }
}

/// Handle to a lending position opened on the market contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub String);

impl PositionId {
    /// Id of a position keyed by its borrower's address.
    pub fn for_borrower(account: &Address) -> Self {
        PositionId(account.0.clone())
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contract operation carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ContractCall {
    /// ERC-20 `approve(spender, amount)` on the target token.
    Approve {
        spender: Address,
        amount: AllowanceAmount,
    },
    /// Mint yield token from base on the minter.
    Mint { amount: Decimal },
    /// Stake yield token into the vault.
    Stake { amount: Decimal },
    /// Open a new collateralized position and borrow against it.
    OpenPosition {
        collateral: Decimal,
        borrow: Decimal,
        receiver: Address,
    },
    /// Add collateral and debt to an existing position.
    AugmentPosition {
        position: PositionId,
        collateral: Decimal,
        borrow: Decimal,
    },
}

impl ContractCall {
    /// Operation kind, used for logging and failure injection.
    pub fn kind(&self) -> CallKind {
        match self {
            ContractCall::Approve { .. } => CallKind::Approve,
            ContractCall::Mint { .. } => CallKind::Mint,
            ContractCall::Stake { .. } => CallKind::Stake,
            ContractCall::OpenPosition { .. } => CallKind::OpenPosition,
            ContractCall::AugmentPosition { .. } => CallKind::AugmentPosition,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Approve,
    Mint,
    Stake,
    OpenPosition,
    AugmentPosition,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallKind::Approve => "approve",
            CallKind::Mint => "mint",
            CallKind::Stake => "stake",
            CallKind::OpenPosition => "open_position",
            CallKind::AugmentPosition => "augment_position",
        };
        write!(f, "{s}")
    }
}

/// A transaction ready for the wallet to sign and submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    /// Contract the call is sent to.
    pub target: Address,
    pub call: ContractCall,
    pub gas_limit: Option<u64>,
}

impl fmt::Display for TxRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.call.kind(), self.target)
    }
}

/// Opaque handle returned by the submitter (usually the tx hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHandle(pub String);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed(String),
}

/// Out-of-band status report for one handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUpdate {
    pub handle: TxHandle,
    pub status: TxStatus,
    /// Position created by a confirmed `OpenPosition`, if any.
    pub opened_position: Option<PositionId>,
    pub timestamp: DateTime<Utc>,
}

impl TxUpdate {
    pub fn new(handle: TxHandle, status: TxStatus) -> Self {
        Self {
            handle,
            status,
            opened_position: None,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a loop run was rejected or abandoned. Every variant is terminal for
/// the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    SubmissionFailure(String),

    #[error("Transaction failed: {0}")]
    ConfirmationFailure(String),

    #[error("Chain read failed: {0}")]
    ChainRead(String),

    #[error("Loop run abandoned")]
    Abandoned,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
