//! Loop orchestrator: the run state machine.
//!
//! Owns the single active `LoopRun` and advances it one step per confirmed
//! transaction. It never talks to the chain itself: `start` and `advance`
//! return an [`Action`] that the caller carries out (usually
//! [`crate::engine::runner::LoopRunner`]), and every collaborator report is
//! fed back in through `advance`. That keeps it testable with plain values.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::planner::{self, LoopConfig, StepContext};
use crate::types::{
    Address, ApprovalState, LoopError, LoopRequest, LoopStep, PositionId, RunStatus, Session,
    TxHandle, TxRequest, TxStatus, TxUpdate,
};

// ---------------------------------------------------------------------------
// Events & actions
// ---------------------------------------------------------------------------

/// Everything that can happen to an in-flight transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// The submitter accepted the request.
    Submitted(TxHandle),
    /// The submitter refused the request (e.g. the user declined to sign).
    SubmissionRejected(String),
    Pending(TxHandle),
    Confirmed {
        handle: TxHandle,
        opened_position: Option<PositionId>,
    },
    /// Mined but reverted, or dropped.
    Failed { handle: TxHandle, reason: String },
}

impl From<TxUpdate> for LoopEvent {
    fn from(update: TxUpdate) -> Self {
        match update.status {
            TxStatus::Pending => LoopEvent::Pending(update.handle),
            TxStatus::Confirmed => LoopEvent::Confirmed {
                handle: update.handle,
                opened_position: update.opened_position,
            },
            TxStatus::Failed(reason) => LoopEvent::Failed {
                handle: update.handle,
                reason,
            },
        }
    }
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Submit this transaction and report back with `Submitted` or
    /// `SubmissionRejected`.
    Submit(TxRequest),
    /// Wait for the next status update.
    Await,
    /// The run reached its target leverage.
    Complete,
    /// The run was abandoned.
    Abort(LoopError),
    /// No run is active; the event was ignored.
    Idle,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// One confirmed step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: LoopStep,
    pub iteration: u32,
    pub handle: TxHandle,
}

/// A single execution instance, owned by the orchestrator.
#[derive(Debug, Clone)]
struct LoopRun {
    request: LoopRequest,
    account: Address,
    approvals: ApprovalState,
    step: LoopStep,
    iteration: u32,
    total_iterations: u32,
    carry: Decimal,
    in_flight: Option<TxHandle>,
    awaiting_submission: bool,
    position: Option<PositionId>,
    borrowed: Decimal,
    history: Vec<StepRecord>,
}

impl LoopRun {
    fn tx_for_current_step(&self, config: &LoopConfig) -> Option<TxRequest> {
        planner::build_tx(
            config,
            &StepContext {
                step: self.step,
                iteration: self.iteration,
                carry: self.carry,
                request: &self.request,
                account: &self.account,
                position: self.position.as_ref(),
            },
        )
    }
}

/// Read-only view of the orchestrator for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopSnapshot {
    pub step: LoopStep,
    pub step_label: String,
    pub iteration: u32,
    pub target_iterations: u32,
    pub carry: Decimal,
    pub borrowed: Decimal,
    pub confirmed_txs: usize,
    pub status: RunStatus,
    pub last_error: Option<String>,
    pub processing: bool,
    pub action_label: String,
    pub updated_at: DateTime<Utc>,
}

impl LoopSnapshot {
    pub fn idle() -> Self {
        Self {
            step: LoopStep::Idle,
            step_label: LoopStep::Idle.label().to_string(),
            iteration: 0,
            target_iterations: 0,
            carry: Decimal::ZERO,
            borrowed: Decimal::ZERO,
            confirmed_txs: 0,
            status: RunStatus::None,
            last_error: None,
            processing: false,
            action_label: action_label(false, RunStatus::None, Decimal::ONE).to_string(),
            updated_at: Utc::now(),
        }
    }
}

/// Label of the main action control.
pub fn action_label(processing: bool, status: RunStatus, amount: Decimal) -> &'static str {
    if processing {
        "Processing..."
    } else if status == RunStatus::Complete {
        "Loop Complete"
    } else if amount <= Decimal::ZERO {
        "Enter Amount"
    } else {
        "Loop Position"
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopSummary {
    pub request: LoopRequest,
    pub iterations: u32,
    pub borrowed: Decimal,
    pub position: Option<PositionId>,
    pub history: Vec<StepRecord>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct LoopOrchestrator {
    config: LoopConfig,
    run: Option<LoopRun>,
    status: RunStatus,
    last_error: Option<String>,
}

impl LoopOrchestrator {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            run: None,
            status: RunStatus::None,
            last_error: None,
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Whether a run is waiting on a transaction.
    pub fn is_processing(&self) -> bool {
        self.run.is_some() && self.status == RunStatus::None
    }

    /// Validate a request against the session and static limits.
    pub fn validate(&self, request: &LoopRequest, session: &Session) -> Result<Address, LoopError> {
        let account = session
            .account()
            .cloned()
            .ok_or_else(|| LoopError::InvalidInput("wallet not connected".into()))?;
        if request.principal <= Decimal::ZERO {
            return Err(LoopError::InvalidInput(format!(
                "principal must be positive, got {}",
                request.principal
            )));
        }
        if request.leverage < Decimal::ONE {
            return Err(LoopError::InvalidInput(format!(
                "leverage must be at least 1x, got {}x",
                request.leverage
            )));
        }
        if request.leverage > self.config.max_leverage {
            return Err(LoopError::InvalidInput(format!(
                "leverage {}x exceeds maximum {}x",
                request.leverage, self.config.max_leverage
            )));
        }
        if request.borrow_ratio <= Decimal::ZERO || request.borrow_ratio >= Decimal::ONE {
            return Err(LoopError::InvalidInput(format!(
                "borrow ratio must be in (0, 1), got {}",
                request.borrow_ratio
            )));
        }
        Ok(account)
    }

    /// Begin a run. Returns the first transaction to submit.
    ///
    /// Rejects with `InvalidInput` (leaving state untouched) when the
    /// request is invalid, the session is disconnected, or another run is
    /// still in flight. A finished or failed run is replaced.
    pub fn start(
        &mut self,
        request: LoopRequest,
        session: &Session,
        approvals: ApprovalState,
    ) -> Result<Action, LoopError> {
        if self.is_processing() {
            return Err(LoopError::InvalidInput(
                "a loop run is already in progress".into(),
            ));
        }
        let account = self.validate(&request, session)?;

        let step = planner::first_step(&approvals);
        if step != LoopStep::ApproveBase {
            debug!("Base approval already granted, skipping approve-base");
        }

        let run = LoopRun {
            total_iterations: request.iterations(),
            carry: request.principal,
            request,
            account,
            approvals,
            step,
            iteration: 1,
            in_flight: None,
            awaiting_submission: false,
            position: None,
            borrowed: Decimal::ZERO,
            history: Vec::new(),
        };

        info!(
            request = %run.request,
            iterations = run.total_iterations,
            approvals_needed = approvals.pending_count(),
            "Loop run started"
        );

        self.run = Some(run);
        self.status = RunStatus::None;
        self.last_error = None;
        Ok(self.submit_current())
    }

    /// Single entry point for collaborator reports.
    pub fn advance(&mut self, event: LoopEvent) -> Action {
        if !self.is_processing() {
            debug!(?event, "No active run, ignoring event");
            return Action::Idle;
        }

        match event {
            LoopEvent::Submitted(handle) => {
                if let Some(run) = self.run.as_mut() {
                    if run.awaiting_submission {
                        debug!(step = %run.step, handle = %handle, "Transaction submitted");
                        run.awaiting_submission = false;
                        run.in_flight = Some(handle);
                    }
                }
                Action::Await
            }
            LoopEvent::SubmissionRejected(reason) => {
                let awaiting = self.run.as_ref().is_some_and(|r| r.awaiting_submission);
                if awaiting {
                    self.fail(LoopError::SubmissionFailure(reason))
                } else {
                    Action::Await
                }
            }
            LoopEvent::Pending(_) => Action::Await,
            LoopEvent::Confirmed {
                handle,
                opened_position,
            } => {
                if self.is_in_flight(&handle) {
                    self.on_confirmed(handle, opened_position)
                } else {
                    debug!(handle = %handle, "Confirmation for unknown handle, ignoring");
                    Action::Await
                }
            }
            LoopEvent::Failed { handle, reason } => {
                if self.is_in_flight(&handle) {
                    self.fail(LoopError::ConfirmationFailure(reason))
                } else {
                    Action::Await
                }
            }
        }
    }

    /// Fail the in-flight run with `error`, as if its transaction failed.
    pub fn abort(&mut self, error: LoopError) -> Action {
        if !self.is_processing() {
            return Action::Idle;
        }
        self.fail(error)
    }

    /// Abandon the current run (user navigated away or started over).
    pub fn reset(&mut self) {
        if let Some(run) = &self.run {
            info!(step = %run.step, iteration = run.iteration, "Loop run reset");
        }
        self.run = None;
        self.status = RunStatus::None;
        self.last_error = None;
    }

    /// Summary of the current run once it has completed.
    pub fn summary(&self) -> Option<LoopSummary> {
        if self.status != RunStatus::Complete {
            return None;
        }
        self.run.as_ref().map(|run| LoopSummary {
            request: run.request.clone(),
            iterations: run.iteration,
            borrowed: run.borrowed,
            position: run.position.clone(),
            history: run.history.clone(),
        })
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        let processing = self.is_processing();
        match &self.run {
            Some(run) => LoopSnapshot {
                step: run.step,
                step_label: run.step.label().to_string(),
                iteration: run.iteration,
                target_iterations: run.total_iterations,
                carry: run.carry,
                borrowed: run.borrowed,
                confirmed_txs: run.history.len(),
                status: self.status,
                last_error: self.last_error.clone(),
                processing,
                action_label: action_label(processing, self.status, run.request.principal)
                    .to_string(),
                updated_at: Utc::now(),
            },
            None => LoopSnapshot {
                status: self.status,
                last_error: self.last_error.clone(),
                ..LoopSnapshot::idle()
            },
        }
    }

    // -- internals --------------------------------------------------------

    fn is_in_flight(&self, handle: &TxHandle) -> bool {
        self.run
            .as_ref()
            .and_then(|r| r.in_flight.as_ref())
            .is_some_and(|h| h == handle)
    }

    fn submit_current(&mut self) -> Action {
        let Some(run) = self.run.as_mut() else {
            return Action::Idle;
        };
        match run.tx_for_current_step(&self.config) {
            Some(tx) => {
                info!(
                    step = %run.step,
                    iteration = run.iteration,
                    carry = format!("{:.2}", run.carry),
                    tx = %tx,
                    "Submitting transaction"
                );
                run.in_flight = None;
                run.awaiting_submission = true;
                Action::Submit(tx)
            }
            None => Action::Await,
        }
    }

    fn on_confirmed(&mut self, handle: TxHandle, opened_position: Option<PositionId>) -> Action {
        let Some(run) = self.run.as_mut() else {
            return Action::Idle;
        };

        info!(
            step = %run.step,
            iteration = run.iteration,
            handle = %handle,
            "Transaction confirmed"
        );
        run.history.push(StepRecord {
            step: run.step,
            iteration: run.iteration,
            handle,
        });
        run.in_flight = None;

        if run.step == LoopStep::BorrowBase {
            let borrowed = planner::borrow_amount(run.carry, run.request.borrow_ratio);
            run.borrowed += borrowed;
            if run.iteration == 1 {
                run.position =
                    Some(opened_position.unwrap_or_else(|| PositionId::for_borrower(&run.account)));
            }

            let next = planner::step_after(
                run.step,
                run.iteration,
                run.total_iterations,
                &run.approvals,
            );
            if next == LoopStep::DepositBase {
                run.iteration += 1;
                run.carry = borrowed;
                run.step = next;
                return self.submit_current();
            }

            run.step = LoopStep::Complete;
            self.status = RunStatus::Complete;
            info!(
                iterations = run.iteration,
                borrowed = format!("{:.2}", run.borrowed),
                position = ?run.position,
                "Loop run complete"
            );
            return Action::Complete;
        }

        run.step = planner::step_after(
            run.step,
            run.iteration,
            run.total_iterations,
            &run.approvals,
        );
        self.submit_current()
    }

    fn fail(&mut self, error: LoopError) -> Action {
        if let Some(run) = &self.run {
            warn!(
                step = %run.step,
                iteration = run.iteration,
                confirmed = run.history.len(),
                error = %error,
                "Loop run failed, resetting to idle"
            );
        }
        self.run = None;
        self.status = RunStatus::Failed;
        self.last_error = Some(error.to_string());
        Action::Abort(error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
