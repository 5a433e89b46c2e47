// ABOUTME: Cursor administration commands
// ABOUTME: Inspect, set, reset and list per-table sync cursors

use anyhow::{bail, Result};
use clap::{Args, Subcommand};

use super::open_store;
use crate::config::ReplicatorConfig;
use crate::incremental::cursor::MANUAL_RUN;
use crate::incremental::CursorStore;

#[derive(Args)]
pub struct CursorArgs {
    #[command(subcommand)]
    command: CursorCommands,
}

#[derive(Subcommand)]
enum CursorCommands {
    /// Show the cursor of a table, corrected against the destination row count
    Get { table: String },
    /// Set the cursor of a table
    Set { table: String, value: u64 },
    /// Reset the cursor of a table to 0
    Reset {
        table: String,
        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// List every stored cursor
    List,
}

pub async fn command(config: &ReplicatorConfig, args: CursorArgs) -> Result<()> {
    let store = open_store(config).await?;
    let cursors = CursorStore::new(&store);

    match args.command {
        CursorCommands::Get { table } => {
            let value = cursors.get(&table).await;
            println!("{}: {}", table, value);
        }
        CursorCommands::Set { table, value } => {
            cursors.set(&table, value, MANUAL_RUN).await?;
            println!("Cursor for '{}' set to {}", table, value);
        }
        CursorCommands::Reset { table, yes } => {
            if !yes {
                bail!(
                    "Resetting re-reads '{}' from the first record. Re-run with --yes to confirm",
                    table
                );
            }
            cursors.reset(&table).await?;
            println!("Cursor for '{}' reset to 0", table);
        }
        CursorCommands::List => {
            let records = cursors.list().await?;
            if records.is_empty() {
                println!("No cursors stored.");
            }
            for record in records {
                println!(
                    "{:<32} {:>10}  {}  {}",
                    record.table_name,
                    record.last_cursor,
                    record.last_sync_at.to_rfc3339(),
                    record.sync_run_id.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
