// ABOUTME: CLI entry point for api-replicator
// ABOUTME: Parses commands and routes to appropriate handlers

use anyhow::Context;
use api_replicator::commands;
use api_replicator::incremental::SyncMode;
use api_replicator::ReplicatorConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "api-replicator")]
#[command(about = "Incremental API-to-PostgreSQL replication CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to config.toml (defaults to ~/.api-replicator/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring in records not yet replicated, starting at the table's cursor
    Sync {
        /// Destination table (and source table) name
        table: String,
        /// Maximum records to fetch in this run
        #[arg(long, default_value_t = 100)]
        limit: usize,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-read a table from the first record, updating rows that exist
    Refresh {
        table: String,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Create the cursor and schema patch tables in the destination
    InitSchema,
    /// Inspect or change sync cursors
    Cursor {
        #[command(flatten)]
        args: commands::cursor::CursorArgs,
    },
    /// Review schema changes proposed by syncs
    Patches {
        #[command(flatten)]
        args: commands::patches::PatchArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    api_replicator::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    let config =
        ReplicatorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Sync { table, limit, json } => {
            commands::sync(&config, &table, limit, SyncMode::IncrementalInsertOnly, json).await
        }
        Commands::Refresh { table, limit, json } => {
            commands::sync(&config, &table, limit, SyncMode::FullRefresh, json).await
        }
        Commands::InitSchema => commands::init_schema(&config).await,
        Commands::Cursor { args } => commands::cursor::command(&config, args).await,
        Commands::Patches { args } => commands::patches::command(&config, args).await,
    }
}
