//! End-to-end loop runs against the mock wallet and the simulated chain.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use looper::chain::simulated::{Fault, SimulatedChain};
use looper::chain::ChainReader;
use looper::config::AppConfig;
use looper::engine::planner::{ApprovalPolicy, Contracts, LoopConfig};
use looper::engine::runner::LoopRunner;
use looper::strategy::metrics::MarketParams;
use looper::types::*;

use crate::mock_wallet::{MockWallet, Outcome};

fn runner_for(wallet: &Arc<MockWallet>) -> LoopRunner {
    LoopRunner::new(
        LoopConfig::default(),
        wallet.clone(),
        wallet.clone(),
        wallet.clone(),
    )
}

fn kinds(requests: &[TxRequest]) -> Vec<CallKind> {
    requests.iter().map(|r| r.call.kind()).collect()
}

// ---------------------------------------------------------------------------
// Mock wallet
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_x_from_scratch() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    let runner = runner_for(&wallet);

    let summary = assert_ok!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );

    use CallKind::*;
    let requests = wallet.requests();
    assert_eq!(
        kinds(&requests),
        vec![Approve, Mint, Approve, Stake, Approve, OpenPosition, Mint, Stake, AugmentPosition]
    );

    match &requests[5].call {
        ContractCall::OpenPosition {
            collateral,
            borrow,
            receiver,
        } => {
            assert_eq!(*collateral, dec!(1000));
            assert_eq!(*borrow, dec!(800));
            assert_eq!(receiver.as_str(), "0xalice");
        }
        other => panic!("expected open, got {other:?}"),
    }
    match &requests[8].call {
        ContractCall::AugmentPosition {
            position,
            collateral,
            borrow,
        } => {
            assert_eq!(position.0, "mock-pos-1");
            assert_eq!(*collateral, dec!(800));
            assert_eq!(*borrow, dec!(640));
        }
        other => panic!("expected augment, got {other:?}"),
    }

    assert_eq!(summary.iterations, 2);
    assert_eq!(summary.borrowed, dec!(1440));
    assert_eq!(summary.history.len(), 9);
    assert!(requests.iter().all(|r| r.gas_limit.is_some()));
}

#[tokio::test]
async fn test_existing_approvals_are_skipped() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    let c = Contracts::default();
    wallet.grant(&c.base_token, &c.minter);
    wallet.grant(&c.staking_vault, &c.lending_market);
    let runner = runner_for(&wallet);

    assert_ok!(
        runner
            .run(LoopRequest::new(dec!(100), dec!(1), dec!(0.80)))
            .await
    );

    // Only the yield token approval was missing.
    use CallKind::*;
    assert_eq!(
        kinds(&wallet.requests()),
        vec![Mint, Approve, Stake, OpenPosition]
    );
}

#[tokio::test]
async fn test_rejected_signature_resets_run() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    wallet.script(vec![
        Outcome::Confirm,
        Outcome::Reject("User rejected the request.".into()),
    ]);
    let runner = runner_for(&wallet);

    let err = assert_err!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );
    assert_eq!(err.to_string(), "User rejected the request.");
    assert_eq!(wallet.requests().len(), 2);

    let snap = runner.snapshot();
    assert_eq!(snap.step, LoopStep::Idle);
    assert_eq!(snap.status, RunStatus::Failed);
    assert!(!snap.processing);
    assert_eq!(snap.action_label, "Loop Position");
}

#[tokio::test]
async fn test_revert_reports_confirmation_failure() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    wallet.script(vec![Outcome::Revert("execution reverted: paused".into())]);
    let runner = runner_for(&wallet);

    let err = assert_err!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );
    assert_eq!(
        err,
        LoopError::ConfirmationFailure("execution reverted: paused".into())
    );
    assert_eq!(err.to_string(), "Transaction failed: execution reverted: paused");

    // Restart is a fresh run from the first unapproved step.
    let summary = assert_ok!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );
    assert_eq!(summary.iterations, 2);
}

#[tokio::test]
async fn test_foreign_confirmations_do_not_advance() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    wallet.script(vec![Outcome::ConfirmAfterNoise; 6]);
    let runner = runner_for(&wallet);

    let summary = assert_ok!(
        runner
            .run(LoopRequest::new(dec!(500), dec!(1), dec!(0.80)))
            .await
    );
    assert_eq!(summary.history.len(), 6);
    assert!(summary
        .history
        .iter()
        .all(|r| r.handle.0.starts_with("0xmock")));
}

#[tokio::test]
async fn test_disconnected_wallet_submits_nothing() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    wallet.disconnect();
    let runner = runner_for(&wallet);

    let err = assert_err!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );
    assert!(matches!(err, LoopError::InvalidInput(_)));
    assert!(wallet.requests().is_empty());
}

#[tokio::test]
async fn test_allowance_read_failure() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    wallet.fail_reads("node unreachable");
    let runner = runner_for(&wallet);

    let err = assert_err!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );
    assert_eq!(err, LoopError::ChainRead("node unreachable".into()));
    assert!(wallet.requests().is_empty());
}

#[tokio::test]
async fn test_preview_falls_back_to_configured_gas_price() {
    let wallet = Arc::new(MockWallet::new("0xalice"));
    let runner = runner_for(&wallet);

    let preview = runner
        .preview(
            &LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)),
            &MarketParams::default(),
            dec!(15),
        )
        .await;
    assert_eq!(preview.gas.gas_price_gwei, dec!(15));
    assert_eq!(preview.gas.transactions, 9);
    // An empty wallet reads as a zero balance, not an unknown one.
    assert_eq!(preview.base_balance, Some(Decimal::ZERO));
}

// ---------------------------------------------------------------------------
// Simulated chain
// ---------------------------------------------------------------------------

fn simulated(account: &Address, balance: Decimal) -> Arc<SimulatedChain> {
    let chain = SimulatedChain::new(Contracts::default());
    chain.connect(account.clone());
    chain.fund(account, balance);
    Arc::new(chain)
}

#[tokio::test]
async fn test_exact_approvals_are_consumed_by_the_run() {
    let user = Address::from("0xbob");
    let chain = simulated(&user, dec!(5000));
    let config = LoopConfig {
        approval_policy: ApprovalPolicy::Exact,
        ..LoopConfig::default()
    };
    let runner = LoopRunner::new(config, chain.clone(), chain.clone(), chain.clone());
    let request = LoopRequest::new(dec!(1000), dec!(3), dec!(0.80));

    let summary = assert_ok!(runner.run(request.clone()).await);
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.borrowed, dec!(800) + dec!(640) + dec!(512));

    let c = chain.contracts().clone();
    let approves: Vec<_> = chain
        .submitted()
        .into_iter()
        .filter_map(|r| match r.call {
            ContractCall::Approve { amount, .. } => Some(amount),
            _ => None,
        })
        .collect();
    assert_eq!(approves, vec![AllowanceAmount::Exact(dec!(2440)); 3]);
    assert_eq!(
        assert_ok!(chain.allowance(&c.base_token, &user, &c.minter).await),
        Decimal::ZERO
    );

    // Nothing left over, so the next run approves again.
    chain.clear_submitted();
    assert_ok!(runner.run(request).await);
    let approvals = chain
        .submitted()
        .iter()
        .filter(|r| r.call.kind() == CallKind::Approve)
        .count();
    assert_eq!(approvals, 3);
}

#[tokio::test]
async fn test_exact_approvals_cover_rounded_carries() {
    let user = Address::from("0xbob");
    let config = LoopConfig {
        approval_policy: ApprovalPolicy::Exact,
        ..LoopConfig::default()
    };

    for (principal, ratio, leverage) in [
        (dec!(1000.123456789012345678), dec!(0.83), dec!(5)),
        (dec!(333.333333333333333333), dec!(0.77), dec!(4)),
        (dec!(0.000000000000000007), dec!(0.61), dec!(3)),
    ] {
        let chain = simulated(&user, dec!(10000));
        let runner = LoopRunner::new(config.clone(), chain.clone(), chain.clone(), chain.clone());
        let request = LoopRequest::new(principal, leverage, ratio);
        let preview = runner
            .preview(&request, &MarketParams::default(), dec!(20))
            .await;

        let summary = assert_ok!(runner.run(request).await, "{principal} at {ratio}");
        assert_eq!(summary.borrowed, preview.total_borrowed);

        // Every approved amount was spent, and no more.
        let c = chain.contracts().clone();
        assert_eq!(
            assert_ok!(chain.allowance(&c.base_token, &user, &c.minter).await),
            Decimal::ZERO
        );
    }
}

#[tokio::test]
async fn test_insufficient_balance_reverts_mid_run() {
    let user = Address::from("0xbob");
    // Approval succeeds, the first mint of 1000 cannot be covered.
    let chain = simulated(&user, dec!(500));
    let runner = LoopRunner::new(
        LoopConfig::default(),
        chain.clone(),
        chain.clone(),
        chain.clone(),
    );

    let err = assert_err!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );
    assert!(matches!(err, LoopError::ConfirmationFailure(m) if m.contains("exceeds balance")));
    assert!(chain.positions_of(&user).is_empty());
}

#[tokio::test]
async fn test_snapshots_track_progress_with_block_time() {
    let user = Address::from("0xbob");
    let chain = SimulatedChain::new(Contracts::default())
        .with_block_time(Duration::from_millis(5));
    chain.connect(user.clone());
    chain.fund(&user, dec!(5000));
    let chain = Arc::new(chain);
    let runner = Arc::new(LoopRunner::new(
        LoopConfig::default(),
        chain.clone(),
        chain.clone(),
        chain.clone(),
    ));

    let mut rx = runner.watch();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let snap = rx.borrow_and_update().clone();
            seen.push(snap.confirmed_txs);
            if snap.status != RunStatus::None {
                break;
            }
        }
        seen
    });

    let summary = assert_ok!(
        runner
            .run(LoopRequest::new(dec!(1000), dec!(2), dec!(0.80)))
            .await
    );
    assert_eq!(summary.history.len(), 9);

    let seen = tokio::time::timeout(Duration::from_secs(5), observer)
        .await
        .unwrap()
        .unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().copied(), Some(9));
}

#[tokio::test]
async fn test_fail_then_restart_on_simulated_chain() {
    let user = Address::from("0xbob");
    let chain = simulated(&user, dec!(5000));
    chain.fail_next(CallKind::Mint, Fault::Reject("User rejected the request.".into()));
    let runner = LoopRunner::new(
        LoopConfig::default(),
        chain.clone(),
        chain.clone(),
        chain.clone(),
    );
    let request = LoopRequest::new(dec!(1000), dec!(2), dec!(0.80));

    let err = assert_err!(runner.run(request.clone()).await);
    assert_eq!(err, LoopError::SubmissionFailure("User rejected the request.".into()));

    // Base approval confirmed before the rejection, so the restart begins at mint.
    chain.clear_submitted();
    assert_ok!(runner.run(request).await);
    assert_eq!(chain.submitted()[0].call.kind(), CallKind::Mint);
}

#[tokio::test]
async fn test_repo_config_drives_a_run() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml");
    let cfg = assert_ok!(AppConfig::load(path));

    let user = Address::new(cfg.demo.default_account.clone());
    let chain = SimulatedChain::new(cfg.contracts.clone());
    chain.connect(user.clone());
    chain.fund(&user, cfg.demo.initial_balance);
    let chain = Arc::new(chain);
    let runner = LoopRunner::new(cfg.loop_config(), chain.clone(), chain.clone(), chain.clone());

    let request = LoopRequest::new(
        cfg.demo.principal,
        cfg.demo.leverage,
        cfg.loop_params.borrow_ratio,
    );
    let summary = assert_ok!(runner.run(request).await);
    assert_eq!(summary.iterations, request_iterations(&cfg));
    assert_eq!(chain.positions_of(&user).len(), 1);
}

fn request_iterations(cfg: &AppConfig) -> u32 {
    LoopRequest::new(cfg.demo.principal, cfg.demo.leverage, cfg.loop_params.borrow_ratio)
        .iterations()
}
