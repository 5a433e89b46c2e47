// ABOUTME: Runs one sync of a table: cursor, fetch, upsert, cursor advance
// ABOUTME: Per-record failures are counted and routed to schema patches, never fatal

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::cursor::CursorStore;
use super::fetcher::{PaginatedFetcher, DEFAULT_INTER_BATCH_DELAY, DEFAULT_MAX_BATCH};
use super::mapper::FieldMapper;
use super::patch::{PatchContext, SchemaPatchWorkflow};
use super::schema_type::{Convention, SchemaTypeCache};
use super::upsert::{SyncMode, UpsertAction, UpsertEngine, UpsertError};
use crate::source::{SourceClient, SourceRecord};
use crate::store::{Destination, Ident};

/// Where a sync run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    FetchingCursor,
    Fetching,
    Upserting,
    UpdatingCursor,
    Done,
    Errored,
}

impl SyncPhase {
    /// Whether the run may move from `self` to `next`.
    ///
    /// Only a fetch failure leads to `Errored`; record failures end the run
    /// in `Done` without passing through `UpdatingCursor`.
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Idle, FetchingCursor)
                | (FetchingCursor, Fetching)
                | (Fetching, Upserting)
                | (Fetching, Errored)
                | (Upserting, UpdatingCursor)
                | (Upserting, Done)
                | (UpdatingCursor, Done)
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::FetchingCursor => "fetching_cursor",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Upserting => "upserting",
            SyncPhase::UpdatingCursor => "updating_cursor",
            SyncPhase::Done => "done",
            SyncPhase::Errored => "errored",
        };
        f.write_str(name)
    }
}

struct PhaseTracker<'a> {
    table: &'a str,
    phase: SyncPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(table: &'a str) -> Self {
        Self {
            table,
            phase: SyncPhase::Idle,
        }
    }

    fn advance(&mut self, next: SyncPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            bail!(
                "Invalid sync phase transition for '{}': {} -> {}",
                self.table,
                self.phase,
                next
            );
        }
        tracing::debug!("Sync of '{}': {} -> {}", self.table, self.phase, next);
        self.phase = next;
        Ok(())
    }
}

/// Outcome of one sync run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub table: String,
    pub run_id: String,
    pub mode: String,
    /// Records inserted
    pub new_records: u64,
    /// Records inserted or updated
    pub synced: u64,
    pub skipped: u64,
    pub errors: u64,
    /// Records returned by the source
    pub fetched: u64,
    pub previous_cursor: u64,
    pub new_cursor: u64,
    pub cursor_updated: bool,
    /// Cursor just past the last fetched record
    pub final_cursor: u64,
    pub patches_created: u64,
    pub phase: SyncPhase,
}

/// Tunables for a sync pipeline.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Source field holding the external id
    pub id_field: String,
    /// Destination column the external id is stored in
    pub id_column: String,
    pub max_batch: usize,
    pub inter_batch_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            id_column: "id".to_string(),
            max_batch: DEFAULT_MAX_BATCH,
            inter_batch_delay: DEFAULT_INTER_BATCH_DELAY,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    inserted: u64,
    updated: u64,
    skipped: u64,
    errors: u64,
    patches_created: u64,
}

/// Composes cursor, fetcher, upsert engine and patch workflow for one table at a time.
///
/// Runs are sequential; callers must not sync the same table concurrently.
pub struct SyncOrchestrator<C, D> {
    source: C,
    store: D,
    mapper: FieldMapper,
    schema_cache: SchemaTypeCache,
    options: SyncOptions,
}

impl<C, D> SyncOrchestrator<C, D>
where
    C: SourceClient,
    D: Destination,
{
    pub fn new(source: C, store: D, mapper: FieldMapper, options: SyncOptions) -> Self {
        Self {
            source,
            store,
            mapper,
            schema_cache: SchemaTypeCache::new(),
            options,
        }
    }

    pub fn source(&self) -> &C {
        &self.source
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    pub fn schema_cache(&self) -> &SchemaTypeCache {
        &self.schema_cache
    }

    pub fn cursors(&self) -> CursorStore<'_, D> {
        CursorStore::new(&self.store)
    }

    pub fn patches(&self) -> SchemaPatchWorkflow<'_, D> {
        SchemaPatchWorkflow::new(&self.store, &self.schema_cache)
    }

    /// Bring in up to `limit` records not yet seen, starting at the table's cursor.
    pub async fn run_incremental_sync(&self, table: &str, limit: usize) -> Result<SyncReport> {
        self.run(SyncMode::IncrementalInsertOnly, table, limit).await
    }

    /// Re-read the table from the beginning, updating rows that already exist.
    pub async fn run_full_refresh(&self, table: &str, limit: usize) -> Result<SyncReport> {
        self.run(SyncMode::FullRefresh, table, limit).await
    }

    async fn run(&self, mode: SyncMode, table: &str, limit: usize) -> Result<SyncReport> {
        let table_ident = Ident::table(table)?;
        let id_column = Ident::column(&self.options.id_column)?;
        let run_id = Uuid::new_v4().to_string();
        let mut tracker = PhaseTracker::new(table);

        tracing::info!(
            "Starting {} sync of '{}' (limit {}, run {})",
            mode,
            table,
            limit,
            run_id
        );

        tracker.advance(SyncPhase::FetchingCursor)?;
        let cursors = self.cursors();
        let previous_cursor = cursors.get(table).await;
        let start = match mode {
            SyncMode::IncrementalInsertOnly => previous_cursor,
            SyncMode::FullRefresh => 0,
        };

        tracker.advance(SyncPhase::Fetching)?;
        let fetcher = PaginatedFetcher::new(&self.source)
            .with_max_batch(self.options.max_batch)
            .with_inter_batch_delay(self.options.inter_batch_delay);
        let fetched = match fetcher.fetch(table, start, limit).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracker.advance(SyncPhase::Errored)?;
                tracing::error!("Sync of '{}' aborted, cursor unchanged: {:#}", table, e);
                return Err(e);
            }
        };

        tracker.advance(SyncPhase::Upserting)?;
        let engine = UpsertEngine::new(
            &self.store,
            &self.mapper,
            &self.schema_cache,
            &self.options.id_field,
            &id_column,
        );
        let mut tally = Tally::default();
        for record in &fetched.records {
            match engine.apply(mode, &table_ident, record).await {
                Ok(UpsertAction::Inserted) => tally.inserted += 1,
                Ok(UpsertAction::Updated) => tally.updated += 1,
                Ok(UpsertAction::Skipped) => tally.skipped += 1,
                Err(e) => {
                    tally.errors += 1;
                    if self.handle_record_error(table, &run_id, record, &e).await {
                        tally.patches_created += 1;
                    }
                }
            }
        }

        let mut new_cursor = previous_cursor;
        let mut cursor_updated = false;
        if tally.errors == 0 {
            tracker.advance(SyncPhase::UpdatingCursor)?;
            new_cursor = match mode {
                SyncMode::IncrementalInsertOnly => {
                    previous_cursor + tally.inserted + tally.updated
                }
                SyncMode::FullRefresh => {
                    let actual = cursors.detect_actual(table).await?;
                    previous_cursor.max(actual)
                }
            };
            cursors.set(table, new_cursor, &run_id).await?;
            cursor_updated = true;
        } else {
            // Pin the cursor so the next run re-reads this batch instead of
            // letting drift correction skip past the failed records.
            cursors.hold(table, previous_cursor, &run_id).await?;
            tracing::warn!(
                "{} record(s) of '{}' failed; cursor held at {}",
                tally.errors,
                table,
                previous_cursor
            );
        }
        tracker.advance(SyncPhase::Done)?;

        let report = SyncReport {
            table: table.to_string(),
            run_id,
            mode: mode.to_string(),
            new_records: tally.inserted,
            synced: tally.inserted + tally.updated,
            skipped: tally.skipped,
            errors: tally.errors,
            fetched: fetched.records.len() as u64,
            previous_cursor,
            new_cursor,
            cursor_updated,
            final_cursor: fetched.final_cursor,
            patches_created: tally.patches_created,
            phase: tracker.phase,
        };

        tracing::info!(
            "Sync of '{}' done: {} new, {} synced, {} skipped, {} errors, cursor {} -> {}",
            table,
            report.new_records,
            report.synced,
            report.skipped,
            report.errors,
            report.previous_cursor,
            report.new_cursor
        );
        Ok(report)
    }

    /// Log a failed record and try to turn its error into a schema patch.
    /// Returns whether a new patch request was created.
    async fn handle_record_error(
        &self,
        table: &str,
        run_id: &str,
        record: &SourceRecord,
        error: &UpsertError,
    ) -> bool {
        let record_id = record.external_id(&self.options.id_field);
        let message = error.to_string();
        tracing::error!(
            "Failed to sync record {} of '{}': {}",
            record_id.as_deref().unwrap_or("<no id>"),
            table,
            message
        );

        if !matches!(error, UpsertError::Store(_)) {
            return false;
        }

        let convention = self
            .schema_cache
            .detect(&self.store, table)
            .await
            .unwrap_or(Convention::Normalized);
        let context = PatchContext {
            table: table.to_string(),
            convention,
            source_fields: record.fields().map(|(name, _)| name.clone()).collect(),
            record_id,
        };

        match self
            .patches()
            .create_pending_request(&message, Some(run_id), &context)
            .await
        {
            Ok(created) => created.is_some(),
            Err(e) => {
                tracing::warn!("Could not record schema patch for '{}': {:#}", table, e);
                false
            }
        }
    }
}
