// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports sync, refresh, init-schema, cursor and patch administration commands

pub mod cursor;
pub mod patches;
pub mod sync;

pub use sync::{init_schema, sync};

use anyhow::{Context, Result};

use crate::config::ReplicatorConfig;
use crate::postgres::connect_with_retry;
use crate::store::PgStore;
use crate::utils::strip_password_from_url;

/// Connect to the destination and make sure the bookkeeping tables exist.
pub async fn open_store(config: &ReplicatorConfig) -> Result<PgStore> {
    config.validate_target()?;
    tracing::info!(
        "Connecting to destination {}",
        strip_password_from_url(&config.target.url)
    );
    let client = connect_with_retry(&config.target.url)
        .await
        .context("Failed to connect to destination database")?;
    let store = PgStore::new(
        client,
        &config.target.cursor_table,
        &config.target.patch_table,
    )?;
    store.ensure_schema().await?;
    Ok(store)
}
