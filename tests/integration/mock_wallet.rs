//! Mock wallet for integration testing.
//!
//! Provides a deterministic wallet implementing every chain collaborator
//! trait. Submissions are recorded, and each one resolves according to a
//! script of outcomes set from test code (confirm by default). All state
//! is in-memory with no ledger semantics.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use looper::chain::{ChainReader, SessionProvider, TransactionSubmitter};
use looper::types::*;

/// How the next submission resolves.
#[derive(Debug, Clone)]
pub enum Outcome {
    Confirm,
    /// Wallet refuses to submit.
    Reject(String),
    /// Submitted, then reported as failed.
    Revert(String),
    /// Confirm, after first broadcasting a confirmation for a handle the
    /// loop never submitted.
    ConfirmAfterNoise,
}

pub struct MockWallet {
    session: Arc<Mutex<Session>>,
    /// (token, spender) → allowance
    allowances: Arc<Mutex<HashMap<(Address, Address), Decimal>>>,
    requests: Arc<Mutex<Vec<TxRequest>>>,
    script: Arc<Mutex<VecDeque<Outcome>>>,
    counter: Arc<Mutex<u64>>,
    updates: broadcast::Sender<TxUpdate>,
    /// If set, allowance reads fail with this error.
    read_error: Arc<Mutex<Option<String>>>,
}

impl MockWallet {
    pub fn new(account: &str) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            session: Arc::new(Mutex::new(Session::Connected(Address::from(account)))),
            allowances: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            counter: Arc::new(Mutex::new(0)),
            updates,
            read_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn disconnect(&self) {
        *self.session.lock().unwrap() = Session::Disconnected;
    }

    pub fn grant(&self, token: &Address, spender: &Address) {
        self.allowances
            .lock()
            .unwrap()
            .insert((token.clone(), spender.clone()), Decimal::MAX);
    }

    /// Queue outcomes for the next submissions, in order.
    pub fn script(&self, outcomes: Vec<Outcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn fail_reads(&self, msg: &str) {
        *self.read_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn requests(&self) -> Vec<TxRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_handle(&self) -> TxHandle {
        let mut n = self.counter.lock().unwrap();
        *n += 1;
        TxHandle(format!("0xmock{:04}", *n))
    }
}

#[async_trait]
impl TransactionSubmitter for MockWallet {
    async fn submit(&self, request: &TxRequest) -> Result<TxHandle> {
        self.requests.lock().unwrap().push(request.clone());
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Confirm);

        if let Outcome::Reject(reason) = &outcome {
            bail!("{reason}");
        }

        let handle = self.next_handle();
        let _ = self
            .updates
            .send(TxUpdate::new(handle.clone(), TxStatus::Pending));

        match outcome {
            Outcome::Revert(reason) => {
                let _ = self
                    .updates
                    .send(TxUpdate::new(handle.clone(), TxStatus::Failed(reason)));
            }
            other => {
                if matches!(other, Outcome::ConfirmAfterNoise) {
                    let _ = self.updates.send(TxUpdate::new(
                        TxHandle("0xstranger".into()),
                        TxStatus::Confirmed,
                    ));
                }
                if let ContractCall::Approve { spender, .. } = &request.call {
                    self.grant(&request.target, spender);
                }
                let opened_position = match request.call {
                    ContractCall::OpenPosition { .. } => Some(PositionId("mock-pos-1".into())),
                    _ => None,
                };
                let _ = self.updates.send(TxUpdate {
                    opened_position,
                    ..TxUpdate::new(handle.clone(), TxStatus::Confirmed)
                });
            }
        }

        Ok(handle)
    }

    fn subscribe(&self) -> broadcast::Receiver<TxUpdate> {
        self.updates.subscribe()
    }
}

#[async_trait]
impl ChainReader for MockWallet {
    async fn allowance(&self, token: &Address, _owner: &Address, spender: &Address) -> Result<Decimal> {
        if let Some(msg) = self.read_error.lock().unwrap().clone() {
            bail!(msg);
        }
        Ok(self
            .allowances
            .lock()
            .unwrap()
            .get(&(token.clone(), spender.clone()))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn balance_of(&self, _token: &Address, _owner: &Address) -> Result<Decimal> {
        Ok(Decimal::ZERO)
    }

    async fn gas_price_gwei(&self) -> Result<Decimal> {
        bail!("gas oracle unavailable")
    }
}

#[async_trait]
impl SessionProvider for MockWallet {
    async fn session(&self) -> Session {
        self.session.lock().unwrap().clone()
    }
}
