// ABOUTME: Schema patch review commands
// ABOUTME: List, show, approve and reject schema changes proposed by syncs

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use super::open_store;
use crate::config::ReplicatorConfig;
use crate::incremental::{SchemaPatchCommand, SchemaPatchWorkflow, SchemaTypeCache};
use crate::store::{PatchRepository, PatchRequest, PatchStatus};

#[derive(Args)]
pub struct PatchArgs {
    #[command(subcommand)]
    command: PatchCommands,
}

#[derive(Subcommand)]
enum PatchCommands {
    /// List schema patches (pending by default)
    List {
        /// Only patches for this table
        #[arg(long)]
        table: Option<String>,
        /// pending, approved, rejected or failed
        #[arg(long, conflicts_with = "all")]
        status: Option<String>,
        /// Include every status
        #[arg(long)]
        all: bool,
    },
    /// Show one patch and the statement approval would run
    Show { id: i64 },
    /// Execute a pending patch
    Approve {
        id: i64,
        /// Who approved the change
        #[arg(long, env = "USER", default_value = "unknown")]
        by: String,
    },
    /// Decline a pending patch without changing the schema
    Reject {
        id: i64,
        #[arg(long, env = "USER", default_value = "unknown")]
        by: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
}

pub async fn command(config: &ReplicatorConfig, args: PatchArgs) -> Result<()> {
    let store = open_store(config).await?;
    let cache = SchemaTypeCache::new();
    let workflow = SchemaPatchWorkflow::new(&store, &cache);

    match args.command {
        PatchCommands::List { table, status, all } => {
            let patches = if all {
                store.list_patches(None, table.as_deref()).await?
            } else if let Some(status) = status {
                let status: PatchStatus = status.parse()?;
                store.list_patches(Some(status), table.as_deref()).await?
            } else {
                workflow.list_pending(table.as_deref()).await?
            };

            if patches.is_empty() {
                println!("No schema patches.");
            }
            for patch in &patches {
                print_summary(patch);
            }
        }
        PatchCommands::Show { id } => {
            let patch = workflow
                .get(id)
                .await?
                .with_context(|| format!("Schema patch {} not found", id))?;
            print_detail(&patch);
        }
        PatchCommands::Approve { id, by } => {
            let patch = workflow.approve(id, &by).await?;
            match patch.status {
                PatchStatus::Approved => println!(
                    "Patch {} applied: {}",
                    id,
                    patch.execution_result.as_deref().unwrap_or("")
                ),
                _ => println!(
                    "Patch {} failed: {}",
                    id,
                    patch.execution_result.as_deref().unwrap_or("unknown error")
                ),
            }
        }
        PatchCommands::Reject { id, by, reason } => {
            workflow.reject(id, &by, &reason).await?;
            println!("Patch {} rejected.", id);
        }
    }
    Ok(())
}

fn print_summary(patch: &PatchRequest) {
    println!(
        "#{:<5} {:<9} {:<18} {}.{} -> {}  ({})",
        patch.id,
        patch.status,
        patch.kind.as_str(),
        patch.table_name,
        patch.field_name,
        patch.suggested_type,
        patch.created_at.format("%Y-%m-%d %H:%M")
    );
}

fn print_detail(patch: &PatchRequest) {
    print_summary(patch);
    println!("  source field:  {}", patch.original_field_name);
    if let Some(ref current) = patch.current_type {
        println!("  current type:  {}", current);
    }
    println!("  error:         {}", patch.error_message);
    if let Ok(command) = SchemaPatchCommand::from_request(patch) {
        println!("  statement:     {}", command.statement().to_sql());
    }
    if let Some(ref result) = patch.execution_result {
        println!("  result:        {}", result);
    }
    if let Some(ref reason) = patch.rejection_reason {
        println!("  rejected:      {}", reason);
    }
}
