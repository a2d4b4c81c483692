//! Find My location history poller
//!
//! Polls tracked devices from Home Assistant on per-device intervals,
//! classifies each position against HA zones and writes the samples to
//! InfluxDB. A small HTTP API toggles tracking and serves the history.
//!
//! Module structure:
//! - `domain/` - Core data types (devices, zones, samples)
//! - `io/` - External interfaces (Home Assistant, InfluxDB, control API)
//! - `services/` - Polling core (scheduler, zone detector, preferences)
//! - `infra/` - Infrastructure (Config, Metrics, Logging)

use anyhow::{bail, Context};
use clap::Parser;
use findmy_history::infra::logging::{init_tracing, mask_token};
use findmy_history::infra::{Config, Metrics};
use findmy_history::io::{start_api_server, ApiContext, HaClient, InfluxClient, StateSource};
use findmy_history::services::{PreferenceStore, Scheduler, ZoneDetector};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Delay between startup connectivity attempts
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Find My location history poller
#[derive(Parser, Debug)]
#[command(name = "findmy-history", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

/// Retry a connectivity check; the last error is returned when all attempts fail
async fn wait_until_reachable<F, Fut>(name: &str, attempts: u32, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match check().await {
            Ok(()) => {
                info!(service = %name, attempt = %attempt, "service_reachable");
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                warn!(service = %name, attempt = %attempt, error = %e, "service_unreachable_retrying");
                tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{name} unreachable after {attempts} attempts"))),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path).with_env_overrides();

    // Structured logging; RUST_LOG overrides the default INFO level
    init_tracing(config.log_format());

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "findmy-history starting");
    info!(
        config_file = %config.config_file(),
        ha_url = %config.ha_url(),
        ha_token = %mask_token(config.ha_token()),
        influx_url = %config.influx_url(),
        influx_database = %config.influx_database(),
        base_tick_secs = %config.base_tick_secs(),
        zone_refresh_ticks = %config.zone_refresh_ticks(),
        default_interval_minutes = %config.default_interval_minutes(),
        prefs_path = %config.prefs_path(),
        api_port = %config.api_port(),
        configured_devices = %config.devices().len(),
        "config_loaded"
    );

    if config.ha_token().trim().is_empty() {
        error!("no Home Assistant token configured (set SUPERVISOR_TOKEN, HA_TOKEN or [home_assistant] token)");
        bail!("missing Home Assistant token");
    }

    let ha = Arc::new(HaClient::new(&config)?);
    let influx = Arc::new(InfluxClient::new(&config)?);

    wait_until_reachable("home_assistant", config.startup_retries(), || ha.ping())
        .await
        .context("startup aborted")?;
    wait_until_reachable("influxdb", config.startup_retries(), || influx.ping())
        .await
        .context("startup aborted")?;

    // One store, shared by the scheduler and the control API
    let prefs = Arc::new(PreferenceStore::open(config.prefs_path(), config.default_interval_minutes()));
    prefs.reconcile(config.devices());

    let metrics = Arc::new(Metrics::new());

    let initial_zones = match ha.fetch_zones().await {
        Ok(zones) => zones,
        Err(e) => {
            warn!(error = %e, "initial_zone_fetch_failed");
            Vec::new()
        }
    };
    metrics.set_zones(initial_zones.len());
    let zones = ZoneDetector::shared(initial_zones);

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start control API (if port > 0)
    let api_port = config.api_port();
    if api_port > 0 {
        let ctx = Arc::new(ApiContext {
            prefs: prefs.clone(),
            zones: zones.clone(),
            source: ha.clone(),
            sink: influx.clone(),
            history: influx.clone(),
            metrics: metrics.clone(),
        });
        let api_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(api_port, ctx, api_shutdown).await {
                error!(error = %e, "control_api_error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    let mut scheduler = Scheduler::new(&config, prefs, zones, ha, influx, metrics);
    scheduler.run(shutdown_rx).await;

    info!("findmy-history shutdown complete");
    Ok(())
}
