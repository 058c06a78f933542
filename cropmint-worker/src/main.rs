//! CropMint tokenization worker
//!
//! Watches the tokenization queue and turns each approved crop evaluation
//! into a collateral-token class plus an issuance to the farmer's account.
//!
//! Usage:
//!   cropmint-worker [--once]
//!
//! Settings are read from flags or the environment (a `.env` file is loaded
//! when present); see `cropmint-worker --help`.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cropmint_core::{WorkerConfig, WorkerContext};
use cropmint_ledger::{GatewayLedgerClient, LedgerClient};
use cropmint_store::SqliteRecordStore;
use cropmint_worker::{OutcomeNotifier, Scheduler, TokenizationOrchestrator, WorkerArgs};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let args = WorkerArgs::parse();
    let config = WorkerConfig::from_raw(&args.raw_settings())?;
    init_logging(&config.log_level);

    log::info!(
        "Starting cropmint-worker on {} as {} (token factory {})",
        config.ledger.network,
        config.ledger.operator_id,
        config.ledger.token_factory
    );

    let ctx = WorkerContext::new(config).context("failed to start async runtime")?;
    let store = Arc::new(SqliteRecordStore::open(&ctx).context("failed to open record store")?);
    let ledger = Arc::new(GatewayLedgerClient::connect(&ctx)?);

    match ledger.probe() {
        Ok(next_token_id) => log::info!(
            "Ledger gateway reachable; next token id is {}",
            next_token_id
        ),
        Err(e) if e.halts_worker() => {
            return Err(e).context("ledger probe failed; check contract id and operator credentials")
        }
        Err(e) => log::warn!("Ledger probe failed, starting anyway: {}", e),
    }

    let orchestrator = Arc::new(TokenizationOrchestrator::new(
        store.clone(),
        ledger,
        OutcomeNotifier::new(store),
    ));
    let scheduler = Scheduler::new(&ctx, orchestrator);

    if args.once {
        let report = scheduler.run_once()?;
        log::info!("Single scan finished: {:?}", report);
        return Ok(());
    }

    let handle = scheduler.handle();
    let runtime = ctx.runtime();
    std::thread::Builder::new()
        .name("cropmint-signals".to_string())
        .spawn(move || match runtime.block_on(tokio::signal::ctrl_c()) {
            Ok(()) => {
                log::info!("Shutdown signal received");
                handle.shutdown();
            }
            Err(e) => log::error!("Failed to listen for shutdown signal: {}", e),
        })
        .context("failed to spawn signal listener")?;

    scheduler.run()?;
    Ok(())
}

fn init_logging(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("Invalid LOG_LEVEL '{}' ({}), using info", directives, e);
        EnvFilter::new("info")
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
