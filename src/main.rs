//! Grid Pilot - main entry point
//!
//! Supports config files: grid-pilot.toml, grid-pilot.yaml, config.toml

use anyhow::Result;
use grid_pilot::persist::{spawn_writer, AccountStatus, ProfitStore, RecordCommand};
use grid_pilot::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before the process dies
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let msg = format!("🛑 PANIC at {}: {}", location, info);
        eprintln!("{}", msg);
        let _ = std::fs::write("grid-pilot-crash.log", format!("{}\n", msg));
        default_panic(info);
    }));

    let config = load_config()?;

    let log_level = config.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(log_level))
        .with_target(false)
        .init();

    info!("Starting Grid Pilot v{}", VERSION);
    info!("  Account: {} ({})", config.account.username, config.account.userid);
    info!("  Levels per side: {}", config.grid.level_count);
    info!("  Level distance: {} ({:?})", config.grid.distance, config.grid.distance_mode);
    info!("  Order size: {}", config.grid.order_size);
    info!("  Max position: {}", config.risk.max_position);
    info!("  Snapshot interval: {}s", config.engine.snapshot_interval_secs);

    // Live venue adapters are wired in by deployment; the default build
    // only carries the paper venue.
    let simulation_mode = std::env::var("SIMULATION_MODE")
        .map(|v| v != "false")
        .unwrap_or(true);
    if !simulation_mode {
        anyhow::bail!("no live exchange adapter configured; unset SIMULATION_MODE=false");
    }
    warn!("🎮 SIMULATION MODE - trading against the paper venue");

    let store = ProfitStore::connect(&config.database.url).await?;
    let (recorder, writer) = spawn_writer(
        store,
        config.account.userid.clone(),
        config.account.username.clone(),
        config.engine.profit_flush_secs.map(Duration::from_secs),
    );
    recorder.record(RecordCommand::Status(AccountStatus::Active));

    let (venue, events) = PaperExchange::new(1024);
    let adapter = Arc::new(venue);

    let planner = GridPlanner::new(config.grid_settings())?;
    let risk = RiskGuard::new(config.risk.max_position)?;
    let settings = EngineSettings::from_config(&config);
    let engine = ReconciliationEngine::new(
        adapter.clone(),
        planner,
        risk,
        settings,
        Some(recorder.clone()),
    )?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received");
            shutdown.cancel();
        });
    }

    // Deterministic reference price for the paper venue: a triangle wave
    // around the configured base, so grid levels fill on both sides.
    let (price_tx, prices) = mpsc::channel::<Decimal>(64);
    {
        let adapter = adapter.clone();
        let shutdown = shutdown.clone();
        let base: Decimal = std::env::var("REFERENCE_PRICE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(dec!(100));
        tokio::spawn(async move {
            let amplitude = base * dec!(0.03);
            let step = amplitude / dec!(12);
            let mut price = base;
            let mut rising = false;
            let mut tick = interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        price += if rising { step } else { -step };
                        if price >= base + amplitude {
                            rising = false;
                        } else if price <= base - amplitude {
                            rising = true;
                        }
                        adapter.tick(price).await;
                        if price_tx.send(price).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    info!("Agent initialized, starting reconciliation loop...");
    engine.run(events, prices, shutdown).await?;

    // Engine already recorded Stopped; dropping the handle lets the
    // writer drain its queue and exit.
    drop(recorder);
    writer.await.ok();
    info!("Shut down cleanly");
    Ok(())
}

/// Load configuration, falling back to defaults for local simulation runs.
fn load_config() -> Result<Config> {
    match Config::load() {
        Ok(config) => Ok(config),
        Err(e) => {
            eprintln!("no usable configuration ({e}), using defaults");
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Parse log level string
fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
