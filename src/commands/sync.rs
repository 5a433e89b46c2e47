// ABOUTME: Sync and refresh commands driving the orchestrator against the configured API
// ABOUTME: Prints a run summary, or the full report as JSON

use anyhow::{Context, Result};

use super::open_store;
use crate::config::ReplicatorConfig;
use crate::incremental::{FieldMapper, SyncMode, SyncOrchestrator, SyncReport};
use crate::source::HttpSourceClient;

/// Run one sync of `table` in the given mode.
pub async fn sync(
    config: &ReplicatorConfig,
    table: &str,
    limit: usize,
    mode: SyncMode,
    json: bool,
) -> Result<()> {
    config.validate()?;

    let source = HttpSourceClient::new(
        &config.source.base_url,
        config.source.api_key.clone(),
        config.request_timeout(),
    )?;
    let store = open_store(config).await?;
    let orchestrator = SyncOrchestrator::new(
        source,
        store,
        FieldMapper::new(config.classifier()),
        config.sync_options(),
    );

    let report = match mode {
        SyncMode::IncrementalInsertOnly => orchestrator.run_incremental_sync(table, limit).await?,
        SyncMode::FullRefresh => orchestrator.run_full_refresh(table, limit).await?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize sync report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("Sync of '{}' ({}) finished: {}", report.table, report.mode, report.phase);
    println!("  fetched:   {}", report.fetched);
    println!("  new:       {}", report.new_records);
    println!("  synced:    {}", report.synced);
    println!("  skipped:   {}", report.skipped);
    println!("  errors:    {}", report.errors);
    if report.cursor_updated {
        println!(
            "  cursor:    {} -> {}",
            report.previous_cursor, report.new_cursor
        );
    } else {
        println!("  cursor:    {} (unchanged)", report.previous_cursor);
    }
    if report.patches_created > 0 {
        println!(
            "\n{} schema patch(es) await review: api-replicator patches list --table {}",
            report.patches_created, report.table
        );
    }
}

/// Create the bookkeeping tables and exit.
pub async fn init_schema(config: &ReplicatorConfig) -> Result<()> {
    open_store(config).await?;
    println!(
        "Bookkeeping tables '{}' and '{}' are ready.",
        config.target.cursor_table, config.target.patch_table
    );
    Ok(())
}
