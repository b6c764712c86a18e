use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("clockfaced starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        bus = ?config.bus,
        threshold = config.similarity_threshold,
        min_margin = config.min_margin,
        utc_offset_minutes = config.utc_offset_minutes,
        encrypted = config.embedding_key_hex.is_some(),
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config).context("failed to start engine")?;

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(engine))?
        .build()
        .await
        .with_context(|| format!("failed to acquire {BUS_NAME}"))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "clockfaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("clockfaced shutting down");

    Ok(())
}
