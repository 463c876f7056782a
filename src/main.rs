//! LOOPER: leverage loop orchestrator
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the loop runner to a simulated chain, optionally serves the
//! dashboard, and executes the configured demo loop.

use anyhow::Result;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use looper::chain::simulated::SimulatedChain;
use looper::config::{self, AppConfig};
use looper::dashboard::{self, routes::DashboardState};
use looper::engine::orchestrator::LoopSummary;
use looper::engine::runner::LoopRunner;
use looper::types::{Address, LoopRequest};

const BANNER: &str = r#"
 _     ___   ___  ____  _____ ____
| |   / _ \ / _ \|  _ \| ____|  _ \
| |  | | | | | | | |_) |  _| | |_) |
| |__| |_| | |_| |  __/| |___|  _ <
|_____\___/ \___/|_|   |_____|_| \_\

  Leverage loop orchestrator
  v0.1.0 (simulated chain)
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        base = %cfg.agent.base_symbol,
        borrow_ratio = %cfg.loop_params.borrow_ratio,
        max_leverage = %cfg.loop_params.max_leverage,
        approval_policy = ?cfg.loop_params.approval_policy,
        "LOOPER starting up"
    );

    // -- Chain & runner --------------------------------------------------

    let account = match AppConfig::resolve_env(&cfg.demo.account_env) {
        Ok(a) => Address::new(a),
        Err(_) => {
            warn!(
                env = %cfg.demo.account_env,
                "Account env not set, using default demo account"
            );
            Address::new(cfg.demo.default_account.clone())
        }
    };

    let chain = Arc::new(
        SimulatedChain::new(cfg.contracts.clone())
            .with_block_time(Duration::from_millis(cfg.demo.block_time_ms))
            .with_gas_price(cfg.gas.fallback_price_gwei),
    );
    chain.fund(&account, cfg.demo.initial_balance);
    chain.connect(account.clone());
    info!(
        account = %account,
        balance = %cfg.demo.initial_balance,
        "Simulated wallet connected"
    );

    let runner = Arc::new(LoopRunner::new(
        cfg.loop_config(),
        chain.clone(),
        chain.clone(),
        chain.clone(),
    ));

    // -- Dashboard -------------------------------------------------------

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState {
            runner: runner.clone(),
            market: cfg.market_params(),
            base_symbol: cfg.agent.base_symbol.clone(),
            borrow_ratio: cfg.loop_params.borrow_ratio,
            max_leverage: cfg.loop_params.max_leverage,
            fallback_gas_price_gwei: cfg.gas.fallback_price_gwei,
        });
        dashboard::spawn_dashboard(state, cfg.dashboard.port).await?;
    }

    // -- Demo loop -------------------------------------------------------

    if cfg.demo.enabled {
        let request = LoopRequest::new(
            cfg.demo.principal,
            cfg.demo.leverage,
            cfg.loop_params.borrow_ratio,
        );

        let preview = runner
            .preview(&request, &cfg.market_params(), cfg.gas.fallback_price_gwei)
            .await;
        info!(
            request = %request,
            size = format!("${:.2}", preview.position_size),
            net_apy = format!("{:.2}%", preview.net_apy),
            health = %preview.health_band,
            txs = preview.gas.transactions,
            gas_native = format!("{:.6}", preview.gas.cost_native),
            wallet = ?preview.base_balance,
            "Position preview"
        );

        match runner.run(request).await {
            Ok(summary) => log_summary(&summary, &cfg.agent.base_symbol),
            Err(e) => error!(error = %e, "Loop run failed"),
        }

        let balance = chain.balance(&cfg.contracts.base_token, &account);
        for position in chain.positions_of(&account) {
            info!(
                position = %position.id,
                collateral = format!("{:.2}", position.collateral),
                debt = format!("{:.2}", position.debt),
                ltv = format!("{:.1}%", ltv_pct(position.debt, position.collateral)),
                "Lending position"
            );
        }
        info!(balance = format!("{:.2}", balance), "Remaining base balance");
    }

    if cfg.dashboard.enabled {
        info!("Dashboard running. Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received.");
    }

    info!("LOOPER shut down cleanly.");
    Ok(())
}

/// Log a human-readable run summary.
fn log_summary(summary: &LoopSummary, base_symbol: &str) {
    info!(
        iterations = summary.iterations,
        borrowed = format!("{:.2} {base_symbol}", summary.borrowed),
        position = ?summary.position,
        txs = summary.history.len(),
        "Loop complete"
    );
}

fn ltv_pct(debt: Decimal, collateral: Decimal) -> Decimal {
    if collateral.is_zero() {
        return Decimal::ZERO;
    }
    debt / collateral * Decimal::ONE_HUNDRED
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("looper=info"));

    let json_logging = std::env::var("LOOPER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
