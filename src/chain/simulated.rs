//! Simulated chain for dry runs and tests.
//!
//! An in-memory ledger that implements every chain collaborator trait.
//! Balances, allowances and lending positions live behind a mutex; each
//! submission is applied atomically and its outcome is broadcast just like
//! a wallet would report a receipt. Failures can be injected per
//! operation kind to exercise the orchestrator's reset path.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ChainReader, SessionProvider, TransactionSubmitter};
use crate::engine::planner::Contracts;
use crate::types::{
    Address, AllowanceAmount, CallKind, ContractCall, PositionId, Session, TxHandle, TxRequest,
    TxStatus, TxUpdate,
};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// One-shot fault armed for the next submission of an operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The wallet refuses to submit (user declined signing).
    Reject(String),
    /// The transaction is mined but reverts.
    Revert(String),
}

/// A collateralized borrow position on the simulated lending market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LendingPosition {
    pub id: PositionId,
    pub owner: Address,
    pub collateral: Decimal,
    pub debt: Decimal,
}

#[derive(Debug, Default)]
struct Ledger {
    /// (token, owner) → balance
    balances: HashMap<(Address, Address), Decimal>,
    /// (token, owner, spender) → allowance; `Decimal::MAX` is unlimited.
    allowances: HashMap<(Address, Address, Address), Decimal>,
    positions: HashMap<PositionId, LendingPosition>,
    next_position: u64,
}

impl Ledger {
    fn balance(&self, token: &Address, owner: &Address) -> Decimal {
        self.balances
            .get(&(token.clone(), owner.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn allowance(&self, token: &Address, owner: &Address, spender: &Address) -> Decimal {
        self.allowances
            .get(&(token.clone(), owner.clone(), spender.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn credit(&mut self, token: &Address, owner: &Address, amount: Decimal) {
        *self
            .balances
            .entry((token.clone(), owner.clone()))
            .or_insert(Decimal::ZERO) += amount;
    }

    fn debit(&mut self, token: &Address, owner: &Address, amount: Decimal) -> Result<()> {
        let balance = self.balance(token, owner);
        if balance < amount {
            bail!("transfer amount exceeds balance ({balance} < {amount})");
        }
        self.balances
            .insert((token.clone(), owner.clone()), balance - amount);
        Ok(())
    }

    /// `transferFrom` by `spender`: consumes allowance, then moves balance.
    fn spend(
        &mut self,
        token: &Address,
        owner: &Address,
        spender: &Address,
        amount: Decimal,
    ) -> Result<()> {
        let allowance = self.allowance(token, owner, spender);
        if allowance < amount {
            bail!("insufficient allowance ({allowance} < {amount})");
        }
        self.debit(token, owner, amount)?;
        if allowance != Decimal::MAX {
            self.allowances
                .insert((token.clone(), owner.clone(), spender.clone()), allowance - amount);
        }
        Ok(())
    }

    /// Apply one call; returns the position opened, if any. Nothing is
    /// written when the call fails.
    fn apply(
        &mut self,
        contracts: &Contracts,
        account: &Address,
        request: &TxRequest,
    ) -> Result<Option<PositionId>> {
        let target = &request.target;
        match &request.call {
            ContractCall::Approve { spender, amount } => {
                let value = match amount {
                    AllowanceAmount::Unlimited => Decimal::MAX,
                    AllowanceAmount::Exact(a) => *a,
                };
                self.allowances
                    .insert((target.clone(), account.clone(), spender.clone()), value);
                Ok(None)
            }
            ContractCall::Mint { amount } => {
                expect_target(target, &contracts.minter)?;
                self.spend(&contracts.base_token, account, &contracts.minter, *amount)?;
                self.credit(&contracts.yield_token, account, *amount);
                Ok(None)
            }
            ContractCall::Stake { amount } => {
                expect_target(target, &contracts.staking_vault)?;
                self.spend(&contracts.yield_token, account, &contracts.staking_vault, *amount)?;
                self.credit(&contracts.staking_vault, account, *amount);
                Ok(None)
            }
            ContractCall::OpenPosition {
                collateral,
                borrow,
                receiver,
            } => {
                expect_target(target, &contracts.lending_market)?;
                check_borrow(*collateral, *borrow)?;
                self.spend(
                    &contracts.staking_vault,
                    account,
                    &contracts.lending_market,
                    *collateral,
                )?;
                self.next_position += 1;
                let id = PositionId(format!("pos-{}", self.next_position));
                self.positions.insert(
                    id.clone(),
                    LendingPosition {
                        id: id.clone(),
                        owner: account.clone(),
                        collateral: *collateral,
                        debt: *borrow,
                    },
                );
                self.credit(&contracts.base_token, receiver, *borrow);
                Ok(Some(id))
            }
            ContractCall::AugmentPosition {
                position,
                collateral,
                borrow,
            } => {
                expect_target(target, &contracts.lending_market)?;
                check_borrow(*collateral, *borrow)?;
                match self.positions.get(position) {
                    Some(p) if &p.owner == account => {}
                    Some(_) => bail!("position {position} not owned by caller"),
                    None => bail!("position {position} does not exist"),
                }
                self.spend(
                    &contracts.staking_vault,
                    account,
                    &contracts.lending_market,
                    *collateral,
                )?;
                if let Some(p) = self.positions.get_mut(position) {
                    p.collateral += *collateral;
                    p.debt += *borrow;
                }
                self.credit(&contracts.base_token, account, *borrow);
                Ok(None)
            }
        }
    }
}

fn expect_target(target: &Address, expected: &Address) -> Result<()> {
    if target != expected {
        bail!("call sent to {target}, expected {expected}");
    }
    Ok(())
}

fn check_borrow(collateral: Decimal, borrow: Decimal) -> Result<()> {
    if borrow > collateral {
        bail!("borrow {borrow} exceeds collateral value {collateral}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Simulated chain
// ---------------------------------------------------------------------------

pub struct SimulatedChain {
    contracts: Contracts,
    ledger: Mutex<Ledger>,
    session: Mutex<Session>,
    faults: Mutex<HashMap<CallKind, Fault>>,
    submitted: Mutex<Vec<TxRequest>>,
    updates: broadcast::Sender<TxUpdate>,
    gas_price_gwei: Decimal,
    block_time: Duration,
}

impl SimulatedChain {
    /// A chain with no accounts funded and no session connected.
    pub fn new(contracts: Contracts) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            contracts,
            ledger: Mutex::new(Ledger::default()),
            session: Mutex::new(Session::Disconnected),
            faults: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            updates,
            gas_price_gwei: dec!(20),
            block_time: Duration::ZERO,
        }
    }

    /// Delay final receipts by `block_time` (spawned on the tokio runtime).
    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }

    pub fn with_gas_price(mut self, gwei: Decimal) -> Self {
        self.gas_price_gwei = gwei;
        self
    }

    pub fn contracts(&self) -> &Contracts {
        &self.contracts
    }

    pub fn connect(&self, account: Address) {
        *lock(&self.session) = Session::Connected(account);
    }

    pub fn disconnect(&self) {
        *lock(&self.session) = Session::Disconnected;
    }

    /// Credit base token to an account.
    pub fn fund(&self, account: &Address, amount: Decimal) {
        lock(&self.ledger).credit(&self.contracts.base_token, account, amount);
    }

    /// Set an allowance directly, as if granted in an earlier session.
    pub fn set_allowance(&self, token: &Address, owner: &Address, spender: &Address, amount: Decimal) {
        lock(&self.ledger)
            .allowances
            .insert((token.clone(), owner.clone(), spender.clone()), amount);
    }

    /// Grant every allowance the loop needs, unlimited.
    pub fn approve_all(&self, owner: &Address) {
        let c = self.contracts.clone();
        self.set_allowance(&c.base_token, owner, &c.minter, Decimal::MAX);
        self.set_allowance(&c.yield_token, owner, &c.staking_vault, Decimal::MAX);
        self.set_allowance(&c.staking_vault, owner, &c.lending_market, Decimal::MAX);
    }

    /// Arm a fault for the next submission of `kind`.
    pub fn fail_next(&self, kind: CallKind, fault: Fault) {
        lock(&self.faults).insert(kind, fault);
    }

    /// Every request passed to `submit`, including rejected ones.
    pub fn submitted(&self) -> Vec<TxRequest> {
        lock(&self.submitted).clone()
    }

    pub fn clear_submitted(&self) {
        lock(&self.submitted).clear();
    }

    pub fn balance(&self, token: &Address, owner: &Address) -> Decimal {
        lock(&self.ledger).balance(token, owner)
    }

    pub fn positions_of(&self, owner: &Address) -> Vec<LendingPosition> {
        let ledger = lock(&self.ledger);
        let mut positions: Vec<LendingPosition> = ledger
            .positions
            .values()
            .filter(|p| &p.owner == owner)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        positions
    }

    fn publish(&self, update: TxUpdate) {
        // No subscribers is fine: nobody is watching this handle.
        let _ = self.updates.send(update);
    }

    fn publish_final(&self, update: TxUpdate) {
        if self.block_time.is_zero() {
            self.publish(update);
            return;
        }
        let sender = self.updates.clone();
        let delay = self.block_time;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(update);
        });
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl TransactionSubmitter for SimulatedChain {
    async fn submit(&self, request: &TxRequest) -> Result<TxHandle> {
        lock(&self.submitted).push(request.clone());

        let account = lock(&self.session)
            .account()
            .cloned()
            .ok_or_else(|| anyhow!("wallet not connected"))?;

        let kind = request.call.kind();
        let fault = lock(&self.faults).remove(&kind);
        if let Some(Fault::Reject(reason)) = &fault {
            info!(kind = %kind, reason = %reason, "Simulated wallet rejected submission");
            bail!("{reason}");
        }

        let handle = TxHandle(format!("0x{}", Uuid::new_v4().simple()));
        self.publish(TxUpdate::new(handle.clone(), TxStatus::Pending));

        let outcome = match fault {
            Some(Fault::Revert(reason)) => Err(anyhow!(reason)),
            _ => lock(&self.ledger).apply(&self.contracts, &account, request),
        };

        let update = match outcome {
            Ok(opened) => {
                debug!(handle = %handle, kind = %kind, "Simulated transaction confirmed");
                TxUpdate {
                    opened_position: opened,
                    ..TxUpdate::new(handle.clone(), TxStatus::Confirmed)
                }
            }
            Err(e) => {
                info!(handle = %handle, kind = %kind, error = %e, "Simulated transaction reverted");
                TxUpdate::new(handle.clone(), TxStatus::Failed(format!("execution reverted: {e}")))
            }
        };
        self.publish_final(update);

        Ok(handle)
    }

    fn subscribe(&self) -> broadcast::Receiver<TxUpdate> {
        self.updates.subscribe()
    }
}

#[async_trait]
impl ChainReader for SimulatedChain {
    async fn allowance(&self, token: &Address, owner: &Address, spender: &Address) -> Result<Decimal> {
        Ok(lock(&self.ledger).allowance(token, owner, spender))
    }

    async fn balance_of(&self, token: &Address, owner: &Address) -> Result<Decimal> {
        Ok(lock(&self.ledger).balance(token, owner))
    }

    async fn gas_price_gwei(&self) -> Result<Decimal> {
        Ok(self.gas_price_gwei)
    }
}

#[async_trait]
impl SessionProvider for SimulatedChain {
    async fn session(&self) -> Session {
        lock(&self.session).clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
