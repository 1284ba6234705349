use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod sessions;
mod store;

use config::{BusKind, Config};
use dbus_interface::{FacegateService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env()?;
    tracing::info!(
        oracle = %config.oracle_url,
        db = %config.db_path.display(),
        spool = %config.spool_dir.display(),
        "configuration loaded"
    );

    let engine = engine::spawn_engine(config.clone()).await?;
    let service = FacegateService::new(engine, &config);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(name = BUS_NAME, bus = ?config.bus, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
