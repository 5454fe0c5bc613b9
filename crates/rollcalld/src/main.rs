use anyhow::{Context, Result};
use rollcall_store::{MemoryStore, RecordStore, SqliteStore};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod insight;

use config::Config;
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use insight::InsightBackend;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    let schedule = config.load_schedule()?;

    let store: Box<dyn RecordStore> = if config.in_memory {
        tracing::warn!("ROLLCALL_IN_MEMORY set; records are not persisted");
        Box::new(MemoryStore::new(schedule))
    } else {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = SqliteStore::open(&config.db_path, schedule)
            .with_context(|| format!("failed to open {}", config.db_path.display()))?;
        tracing::info!(path = %config.db_path.display(), "record store opened");
        Box::new(store)
    };

    let classifier = InsightBackend::from_config(&config);
    let engine = engine::spawn_engine(config.engine_settings(), store, classifier)?;

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(engine))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
