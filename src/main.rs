// =============================================================================
// Multi-timeframe overlay engine — entry point
// =============================================================================
//
// Spawns one `DriverLoop` per configured symbol (each instance internally
// rolls up and drives every overlay timeframe; see driver.rs), starts the
// read-only status API, and waits for Ctrl+C to cancel every driver and
// drain its log emitter. Generalized from a per-symbol `tokio::spawn` shape
// with five fixed streams-per-symbol to one cooperative driver per symbol.
// =============================================================================

mod api;
mod bandit;
mod binance;
mod bma;
mod cohort;
mod combiner;
mod config;
mod data_model;
mod driver;
mod emitter;
mod error;
mod execution;
mod features;
mod guards;
mod health;
mod model;
mod reason_codes;
mod risk;
mod rollup;
mod signal;
mod types;
mod venue;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::ApiState;
use crate::binance::client::BinanceClient;
use crate::config::RuntimeConfig;
use crate::driver::DriverLoop;
use crate::emitter::LogEmitter;
use crate::model::ModelRuntime;
use crate::venue::BinanceVenue;

/// Default model manifest path when `MODEL_MANIFEST_PATH` is unset. A
/// missing manifest is a configuration invariant violation and is fatal at
/// startup; a manifest whose referenced model artifact fails to load
/// degrades to a neutral predictor instead, handled inside
/// `ModelRuntime::load`.
const DEFAULT_MANIFEST_PATH: &str = "config/manifest.json";

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("overlay engine starting");

    // ── 1. Per-instance config root ──────────────────────────────────────
    // One RuntimeConfig names exactly one `data.symbol`; a multi-symbol
    // deployment is one config file per symbol under `config_root`, falling
    // back to a single `runtime_config.json` overridden by `SYMBOLS` for a
    // quick multi-symbol demo run.
    let config_root = std::env::var("CONFIG_ROOT").unwrap_or_else(|_| "config".to_string());
    let base_config = RuntimeConfig::load(format!("{config_root}/runtime_config.json"))
        .unwrap_or_else(|e| {
            warn!(error = %e, "failed to load base runtime config, using defaults");
            RuntimeConfig::default()
        });

    let symbols: Vec<String> = std::env::var("SYMBOLS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim().to_uppercase())
                .filter(|x| !x.is_empty())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec![base_config.data.symbol.clone()]);

    info!(?symbols, "configured symbols");

    // ── 2. Model manifest path. `ModelRuntime` holds a `Box<dyn Predictor>`
    //    and is not `Clone`, so each symbol instance loads its own runtime
    //    from the same manifest below (the artifact contract is
    //    symbol-agnostic; loading is cheap, I/O-bound startup work, not a
    //    per-bar cost). Validate once up front so a missing/unparseable
    //    manifest fails fast before any driver spawns.
    let manifest_path =
        std::env::var("MODEL_MANIFEST_PATH").unwrap_or_else(|_| DEFAULT_MANIFEST_PATH.to_string());
    ModelRuntime::load(&manifest_path, None).map_err(|e| {
        error!(error = %e, path = %manifest_path, "fatal: model manifest could not be read/parsed");
        e
    })?;

    // ── 3. Binance client (shared REST signer across symbols) ───────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance_client = BinanceClient::new(api_key, api_secret);

    // ── 4. Shared status API ─────────────────────────────────────────────
    let api_state = ApiState::new(now_ms());
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    {
        let api_state = api_state.clone();
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "status API listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "status API server failed");
                    }
                }
                Err(e) => error!(error = %e, addr = %bind_addr, "failed to bind status API"),
            }
        });
    }

    // ── 5. Log root (partitioned emitter base_dir) ───────────────────────
    let log_root = std::env::var("PAPER_TRADING_ROOT").unwrap_or_else(|_| "paper_trading_output".to_string());
    let run_id = uuid::Uuid::new_v4().to_string();

    let one_shot = std::env::var("LIVE_DEMO_ONE_SHOT").map(|v| v == "1").unwrap_or(false);
    let offline = std::env::var("LIVE_DEMO_OFFLINE").map(|v| v == "1").unwrap_or(false);
    if let Ok(v) = std::env::var("DRY_RUN") {
        if v == "1" {
            info!("DRY_RUN=1: execution still simulates paper fills (engine is paper-only regardless)");
        }
    }
    // Model retraining cadence is an external collaborator (the ML training
    // pipeline is out of scope here); read-and-log only so the core accepts
    // the same environment contract as the rest of the deployment.
    if let Ok(freq) = std::env::var("LLM_FREQ_MINUTES") {
        info!(llm_freq_minutes = %freq, "model retraining cadence configured (no-op in this core)");
    }

    let poll_interval = std::time::Duration::from_secs(5);

    // ── 6. Cancellation plumbing ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for symbol in &symbols {
        let mut config = base_config.clone();
        config.data.symbol = symbol.clone();
        config.trading_mode = types::TradingMode::Paused;
        config.emitter.base_dir = format!("{log_root}/{}", config.emitter.base_dir.trim_start_matches("./"));

        let tz: chrono_tz::Tz = config.local_timezone.parse().unwrap_or(chrono_tz::UTC);
        let emitter = LogEmitter::new(config.emitter.clone(), tz);

        let venue: Arc<dyn venue::MarketDataVenue> = Arc::new(BinanceVenue::new(binance_client.clone()));

        // The cohort fill feed (per-address pros/amateurs/mood trade flow)
        // is an external collaborator out of scope here; `fill_tx` is kept
        // alive so `drain_fills` sees "no fills yet" rather than a
        // disconnected channel, and is the attachment point for a future
        // cohort ingestion task.
        let (fill_tx, fill_rx) = mpsc::channel(20_000);
        std::mem::forget(fill_tx);

        let bandit_checkpoint = format!("{log_root}/bandit/{symbol}.json");
        if let Some(parent) = std::path::Path::new(&bandit_checkpoint).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let model = ModelRuntime::load(&manifest_path, None)
            .expect("manifest already validated readable at startup");

        let mut driver = DriverLoop::new(
            config,
            venue,
            model,
            api_state.clone(),
            emitter,
            bandit_checkpoint,
            fill_rx,
            run_id.clone(),
        );

        let shutdown_rx = shutdown_rx.clone();
        let symbol = symbol.clone();
        handles.push(tokio::spawn(async move {
            driver.run(one_shot, offline, shutdown_rx, poll_interval).await;
            info!(symbol = %symbol, "driver instance stopped");
        }));
    }

    info!(count = handles.len(), "driver instances launched");

    if one_shot || offline {
        for h in handles {
            let _ = h.await;
        }
        info!("one-shot/offline run complete, exiting");
        return Ok(());
    }

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping drivers");
    let _ = shutdown_tx.send(true);

    for h in handles {
        let _ = h.await;
    }

    // Each driver already checkpoints its own bandit state on exit
    // (driver.rs::run); persist the base config here so a restart resumes
    // with the same trading/account mode.
    if let Err(e) = base_config.save(format!("{config_root}/runtime_config.json")) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("overlay engine shut down complete");
    Ok(())
}
