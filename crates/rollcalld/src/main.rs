use anyhow::{Context, Result};
use rollcall_attendance::AttendanceSessionManager;
use rollcall_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;
mod sweeper;
mod timetable;

use config::{Bus, Config};
use dbus_interface::{AttendanceBus, BUS_NAME, OBJECT_PATH};
use service::AttendanceService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");
    let config = Config::from_env();

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    if let Some(path) = &config.timetable_path {
        timetable::import(path, &store).with_context(|| format!("importing timetable {}", path.display()))?;
    }

    let manager = Arc::new(AttendanceSessionManager::new(
        Arc::new(store),
        config.schedule_window()?,
        config.session_policy(),
    ));

    let engine = engine::spawn_engine(&config).context("loading face models")?;
    let service = Arc::new(AttendanceService::new(
        engine,
        Arc::clone(&manager),
        config.recognition_threshold,
    )?);

    let sweeper = sweeper::spawn_sweeper(manager, Duration::from_secs(config.sweep_interval_secs.max(1)));

    let builder = match config.bus {
        Bus::Session => zbus::connection::Builder::session()?,
        Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceBus::new(service))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");
    sweeper.abort();

    Ok(())
}
