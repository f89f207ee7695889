mod bridge;
mod bus;
mod config;
mod controller;
mod db;
mod error;
mod ingest;
mod schedule;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::{env, sync::Arc, time::Duration};
use time::UtcOffset;
use tracing::{info, warn};

use bus::{Broker, ClientSession, Credentials};
use config::Config;
use controller::Controller;
use db::SqliteStore;
use schedule::SystemClock;
use store::{MemoryStore, Store};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    cfg.apply_env(|key| env::var(key).ok());
    cfg.validate().context("invalid config after env overrides")?;

    // The local offset can only be probed while the process is still
    // single-threaded, so resolve it before the runtime exists.
    let offset = resolve_offset(&cfg)?;
    info!(%offset, "time zone resolved");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(cfg, offset))
}

fn resolve_offset(cfg: &Config) -> Result<UtcOffset> {
    if let Some(s) = &cfg.utc_offset {
        return config::parse_utc_offset(s);
    }
    match UtcOffset::current_local_offset() {
        Ok(offset) => Ok(offset),
        Err(e) => {
            warn!("local utc offset unavailable ({e}), using UTC");
            Ok(UtcOffset::UTC)
        }
    }
}

async fn run(cfg: Config, offset: UtcOffset) -> Result<()> {
    // ── State store ─────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:greenhouse.db?mode=rwc".to_string());
    let store: Arc<dyn Store> = if db_url == "memory" {
        warn!("DB_URL=memory: shared state will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let db = SqliteStore::connect(&db_url).await?;
        db.migrate().await?;
        info!(db = %db_url, "state store ready");
        Arc::new(db)
    };

    // ── Activity log (ephemeral, for the status API) ────────────────
    let shared = state::new_shared();
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── Message bus ─────────────────────────────────────────────────
    let broker = Arc::new(Broker::new(
        Credentials::new(&cfg.broker.username, &cfg.broker.password),
        Arc::clone(&store),
        Arc::clone(&shared),
    ));
    let password = STANDARD.encode(&cfg.broker.password);
    let local_session = |client_id: &str| -> Result<ClientSession> {
        broker
            .connect(client_id, Some(&cfg.broker.username), Some(password.as_bytes()))
            .with_context(|| format!("local client '{client_id}' rejected by bus"))
    };

    // ── Controller ──────────────────────────────────────────────────
    let opts = cfg.controller_options()?;
    info!(
        light = %opts.light_relay,
        pump = %opts.pump_relay,
        pump_slots = opts.pump_schedule.len(),
        "controller configured"
    );
    let controller = Arc::new(Controller::new(
        Arc::clone(&store),
        Arc::clone(&broker),
        SystemClock::new(offset),
        opts,
        Arc::clone(&shared),
    ));
    let controller_handle = controller.start();

    // ── Sensor adapters ─────────────────────────────────────────────
    if let Some(port) = cfg.sensors.environment_port.clone() {
        let session = local_session("arduino-environment")?;
        tokio::spawn(ingest::run_environment(
            port,
            cfg.sensors.environment_baud,
            session,
        ));
    }
    if let Some(port) = cfg.sensors.ultrasonic_port.clone() {
        let session = local_session("ultrasonic")?;
        tokio::spawn(ingest::run_ultrasonic(
            port,
            cfg.sensors.ultrasonic_baud,
            cfg.sensors.water_level_full_scale,
            Duration::from_secs(cfg.sensors.water_level_interval_sec),
            session,
        ));
    }

    // ── Uplink bridge ───────────────────────────────────────────────
    if cfg.bridge.enabled {
        let session = local_session("bridge")?;
        let mut devices = cfg.relay_devices();
        if cfg.sensors.environment_port.is_none() {
            // No local sensor: take environment telemetry from upstream.
            devices.push(ingest::ENVIRONMENT_DEVICE.to_string());
        }
        tokio::spawn(bridge::run(
            cfg.bridge,
            devices,
            session,
            Arc::clone(&shared),
        ));
    } else {
        info!("bridge disabled");
    }

    // ── Status API ──────────────────────────────────────────────────
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3000);
    tokio::spawn(web::serve(
        web::AppState {
            shared: Arc::clone(&shared),
            store: Arc::clone(&store),
        },
        web_port,
    ));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    controller_handle.stop().await;
    broker.shutdown();
    shared
        .write()
        .await
        .record_system("hub stopped".to_string());
    Ok(())
}
