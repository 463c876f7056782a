//! Chain collaborators.
//!
//! Defines the traits the loop depends on but does not implement:
//! - `TransactionSubmitter`: the wallet. Signs and sends transactions and
//!   reports their status out of band
//! - `ChainReader` serves balances, allowances and gas price on demand
//! - `SessionProvider` reports which account (if any) is connected
//!
//! `simulated` provides an in-memory ledger implementing all three.

pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::types::{Address, Session, TxHandle, TxRequest, TxUpdate};

/// Wallet-side transaction submission.
///
/// `submit` returns once the wallet has accepted (signed and broadcast)
/// the request. Progress for the returned handle arrives on the channel
/// from `subscribe`; subscribe before submitting so no update is missed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    async fn submit(&self, request: &TxRequest) -> Result<TxHandle>;

    /// Status updates for every handle this submitter issues.
    fn subscribe(&self) -> broadcast::Receiver<TxUpdate>;
}

/// Read-only chain queries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// ERC-20 allowance granted by `owner` to `spender` on `token`.
    async fn allowance(&self, token: &Address, owner: &Address, spender: &Address)
        -> Result<Decimal>;

    async fn balance_of(&self, token: &Address, owner: &Address) -> Result<Decimal>;

    /// Current network gas price in gwei.
    async fn gas_price_gwei(&self) -> Result<Decimal>;
}

/// Active wallet session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self) -> Session;
}
