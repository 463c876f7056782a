//! Loop runner.
//!
//! Drives a `LoopOrchestrator` against the injected chain collaborators:
//! reads the session and allowances, submits each transaction the
//! orchestrator asks for, and feeds every status update back through
//! `advance`. One transaction is outstanding at a time and the runner
//! waits on the update channel indefinitely.
//!
//! A snapshot is published on a `watch` channel after every state change
//! so readers never contend with the run for the orchestrator lock.
//!
//! At most one run holds the busy gate at a time. The gate is a `RunGuard`
//! that clears on drop, so a run whose future is dropped mid-flight still
//! releases it.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use super::orchestrator::{Action, LoopEvent, LoopOrchestrator, LoopSnapshot, LoopSummary};
use super::planner::LoopConfig;
use crate::chain::{ChainReader, SessionProvider, TransactionSubmitter};
use crate::strategy::metrics::MarketParams;
use crate::strategy::{self, PositionPreview};
use crate::types::{Address, ApprovalState, LoopError, LoopRequest};

pub struct LoopRunner {
    orchestrator: Mutex<LoopOrchestrator>,
    submitter: Arc<dyn TransactionSubmitter>,
    reader: Arc<dyn ChainReader>,
    session: Arc<dyn SessionProvider>,
    snapshots: watch::Sender<LoopSnapshot>,
    busy: Arc<AtomicBool>,
}

/// Claim on the runner's busy gate. Released when dropped.
#[derive(Debug)]
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl LoopRunner {
    pub fn new(
        config: LoopConfig,
        submitter: Arc<dyn TransactionSubmitter>,
        reader: Arc<dyn ChainReader>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        let (snapshots, _) = watch::channel(LoopSnapshot::idle());
        Self {
            orchestrator: Mutex::new(LoopOrchestrator::new(config)),
            submitter,
            reader,
            session,
            snapshots,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a run is in flight. Gates the action control.
    pub fn is_processing(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> LoopSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<LoopSnapshot> {
        self.snapshots.subscribe()
    }

    /// Check a request against the current session and limits without
    /// starting a run.
    pub async fn validate(&self, request: &LoopRequest) -> Result<Address, LoopError> {
        let session = self.session.session().await;
        self.orchestrator.lock().await.validate(request, &session)
    }

    /// Take the busy gate, or `None` if a run already holds it.
    pub fn try_claim(&self) -> Option<RunGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                busy: self.busy.clone(),
            })
    }

    /// Execute a full loop run. Resolves when the run completes or fails.
    pub async fn run(&self, request: LoopRequest) -> Result<LoopSummary, LoopError> {
        let guard = self.try_claim().ok_or_else(|| {
            LoopError::InvalidInput("a loop run is already in progress".into())
        })?;
        self.run_claimed(guard, request).await
    }

    /// Execute a run under a gate the caller already holds. The gate is
    /// released when this resolves or is dropped.
    pub async fn run_claimed(
        &self,
        _guard: RunGuard,
        request: LoopRequest,
    ) -> Result<LoopSummary, LoopError> {
        self.drive(request).await
    }

    /// Abandon the current run. An in-flight transaction still settles
    /// on-chain; its update is ignored.
    pub async fn reset(&self) {
        let mut orch = self.orchestrator.lock().await;
        orch.reset();
        self.publish(&orch);
    }

    /// Preview metrics for a request, using live approvals, wallet balance
    /// and gas price when available.
    pub async fn preview(
        &self,
        request: &LoopRequest,
        market: &MarketParams,
        fallback_gas_price_gwei: Decimal,
    ) -> PositionPreview {
        let config = self.orchestrator.lock().await.config().clone();
        let session = self.session.session().await;

        let (approvals, base_balance) = match session.account() {
            Some(account) => {
                let approvals = self
                    .read_approvals(&config, request, account)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Allowance read failed, assuming no approvals");
                        ApprovalState::none()
                    });
                let balance = match self
                    .reader
                    .balance_of(&config.contracts.base_token, account)
                    .await
                {
                    Ok(balance) => Some(balance),
                    Err(e) => {
                        warn!(error = %e, "Balance read failed");
                        None
                    }
                };
                (approvals, balance)
            }
            None => (ApprovalState::none(), None),
        };
        let gas_price = self
            .reader
            .gas_price_gwei()
            .await
            .unwrap_or(fallback_gas_price_gwei);

        PositionPreview {
            base_balance,
            ..strategy::preview(request, &approvals, market, &config.gas, gas_price)
        }
    }

    // -- internals --------------------------------------------------------

    async fn drive(&self, request: LoopRequest) -> Result<LoopSummary, LoopError> {
        let session = self.session.session().await;
        let (config, account) = {
            let mut orch = self.orchestrator.lock().await;
            if orch.is_processing() {
                // Left behind by a run whose future was dropped.
                warn!("Discarding orphaned run");
                orch.reset();
                self.publish(&orch);
            }
            let account = orch.validate(&request, &session)?;
            (orch.config().clone(), account)
        };

        let approvals = self.read_approvals(&config, &request, &account).await?;

        // Subscribe before the first submission so no update is missed.
        let mut updates = self.submitter.subscribe();

        let mut action = {
            let mut orch = self.orchestrator.lock().await;
            let action = orch.start(request, &session, approvals);
            self.publish(&orch);
            action?
        };

        loop {
            action = match action {
                Action::Submit(tx) => {
                    let event = match self.submitter.submit(&tx).await {
                        Ok(handle) => LoopEvent::Submitted(handle),
                        Err(e) => LoopEvent::SubmissionRejected(e.to_string()),
                    };
                    self.apply(event).await
                }
                Action::Await => match updates.recv().await {
                    Ok(update) => self.apply(update.into()).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Transaction updates lagged");
                        Action::Await
                    }
                    Err(RecvError::Closed) => {
                        let mut orch = self.orchestrator.lock().await;
                        let action = orch.abort(LoopError::ConfirmationFailure(
                            "transaction status channel closed".into(),
                        ));
                        self.publish(&orch);
                        action
                    }
                },
                Action::Complete => {
                    let orch = self.orchestrator.lock().await;
                    let summary = orch.summary().ok_or(LoopError::Abandoned)?;
                    info!(
                        iterations = summary.iterations,
                        borrowed = format!("{:.2}", summary.borrowed),
                        txs = summary.history.len(),
                        "Loop finished"
                    );
                    return Ok(summary);
                }
                Action::Abort(e) => return Err(e),
                Action::Idle => return Err(LoopError::Abandoned),
            };
        }
    }

    async fn apply(&self, event: LoopEvent) -> Action {
        let mut orch = self.orchestrator.lock().await;
        let action = orch.advance(event);
        self.publish(&orch);
        action
    }

    fn publish(&self, orch: &LoopOrchestrator) {
        self.snapshots.send_replace(orch.snapshot());
    }

    async fn read_approvals(
        &self,
        config: &LoopConfig,
        request: &LoopRequest,
        account: &Address,
    ) -> Result<ApprovalState, LoopError> {
        let c = &config.contracts;
        let (base, yield_token, collateral) = futures::try_join!(
            self.reader.allowance(&c.base_token, account, &c.minter),
            self.reader.allowance(&c.yield_token, account, &c.staking_vault),
            self.reader.allowance(&c.staking_vault, account, &c.lending_market),
        )
        .map_err(|e| LoopError::ChainRead(e.to_string()))?;
        Ok(config.approvals_from(request, base, yield_token, collateral))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
