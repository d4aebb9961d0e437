//! Autonomous trader for 15-minute up/down binary markets.
//!
//! Ingests Coinbase spot prices and candles, discovers the live binary
//! market per asset, scores a direction from recent price action, gates
//! every candidate order through layered risk checks, executes marketable
//! limits against the CLOB and manages take-profit / stop-loss exits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{
    ClobClient, Clock, CoinbaseClient, Config, Database, GammaClient, OrderSigner, PgStore,
    StateStore, SystemClock, WalletSigner,
};

mod discovery;
mod execution;
mod ingest;
mod positions;
mod risk;
mod signal;
mod worker;

use discovery::MarketDiscoverer;
use execution::ExecutionModule;
use ingest::PriceIngester;
use positions::PositionManager;
use risk::RiskGate;
use signal::SignalGenerator;
use worker::TradingWorker;

/// Autonomous trader for 15-minute up/down binary markets
#[derive(Parser, Debug)]
#[command(name = "updown-trader")]
#[command(about = "Trades 15-minute up/down binary markets from spot momentum")]
struct Args {
    /// Run a single trading cycle and exit
    #[arg(long)]
    once: bool,

    /// Simulation mode: orders are persisted but never reach the venue
    #[arg(long)]
    dry_run: bool,

    /// Put the bot in RUNNING state on startup
    #[arg(long)]
    start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::from_env()?;

    info!("=== Up/Down Trader ===");
    info!("Assets: {:?}", config.assets);
    info!("Loop interval: {}s", config.loop_interval_secs);

    let db = Database::connect(&config)
        .await
        .context("database connection failed")?;
    db.migrate().await.context("schema migration failed")?;
    info!("Database connected");

    let store: Arc<dyn StateStore> = Arc::new(PgStore::new(db));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    seed_config_defaults(store.as_ref()).await?;

    let price_source = Arc::new(CoinbaseClient::new(&config)?);
    let market_source = Arc::new(GammaClient::new(&config)?);
    let venue = Arc::new(ClobClient::new(&config)?);

    let signer: Option<Arc<dyn OrderSigner>> = if args.dry_run {
        None
    } else {
        match &config.credentials {
            Some(credentials) => Some(Arc::new(
                WalletSigner::from_private_key(&credentials.private_key)
                    .context("invalid trader private key")?,
            )),
            None => None,
        }
    };
    if signer.is_some() {
        info!("Mode: LIVE");
    } else {
        warn!("No trader credentials in effect - running in SIMULATION");
    }

    let ingester = Arc::new(PriceIngester::new(
        price_source,
        store.clone(),
        clock.clone(),
        config.assets.clone(),
    ));
    let discoverer = MarketDiscoverer::new(
        market_source,
        venue.clone(),
        store.clone(),
        clock.clone(),
        config.assets.clone(),
    );
    let signal = SignalGenerator::new(store.clone(), clock.clone());
    let risk = RiskGate::new(store.clone(), clock.clone(), config.assets.clone());
    let execution = ExecutionModule::new(venue, signer, store.clone(), clock.clone());
    let positions = PositionManager::new(store.clone(), clock.clone());

    let worker = TradingWorker::new(
        ingester.clone(),
        discoverer,
        signal,
        risk,
        execution,
        positions,
        store.clone(),
        clock.clone(),
        config.assets.clone(),
        Duration::from_secs(config.loop_interval_secs),
    );

    // Candles first so the very first cycle has a signal window, then
    // reconcile whatever survived the last shutdown.
    ingester.backfill().await;
    worker
        .reconcile_startup()
        .await
        .context("startup reconciliation failed")?;

    if args.start {
        match worker.start_bot("cli").await {
            Ok(()) => info!("Bot started"),
            Err(e) => error!("Bot not started: {e}"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingest_handle = ingester.clone().spawn(shutdown_rx.clone());

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            signal_tx.send(true).ok();
        }
    });

    if args.once {
        worker.cycle().await?;
        info!("Single cycle complete");
        shutdown_tx.send(true).ok();
        worker.shutdown().await;
    } else {
        worker.run(shutdown_rx).await;
    }

    ingest_handle.await.ok();
    info!("Trader stopped");
    Ok(())
}

/// Insert defaults for any recognized config key not yet present.
async fn seed_config_defaults(store: &dyn StateStore) -> Result<()> {
    let existing: HashSet<String> = store
        .config_entries()
        .await?
        .into_iter()
        .map(|(key, _)| key)
        .collect();

    for (key, value) in risk::config_defaults() {
        if !existing.contains(key) {
            store.set_config(key, value, "system").await?;
        }
    }
    Ok(())
}
