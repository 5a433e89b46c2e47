// ABOUTME: Durable per-table pagination cursor with self-correction
// ABOUTME: Reconciles the stored cursor with the destination row count on every read

use anyhow::{Context, Result};

use crate::store::{CursorRecord, CursorRepository, DestinationStore, Ident, Statement};

/// Run marker stamped on cursors written by a self-correction.
pub const SELF_CORRECTION_RUN: &str = "self-correction";
/// Run marker stamped on cursors written by an explicit reset.
pub const RESET_RUN: &str = "reset";
/// Run marker for cursors set by an operator.
pub const MANUAL_RUN: &str = "manual";
/// Prefix of the run marker written when a run with record errors keeps the cursor.
pub const HELD_RUN_PREFIX: &str = "held:";

/// Reads and writes sync cursors for destination tables.
pub struct CursorStore<'a, D: ?Sized> {
    store: &'a D,
}

impl<'a, D> CursorStore<'a, D>
where
    D: DestinationStore + CursorRepository + ?Sized,
{
    pub fn new(store: &'a D) -> Self {
        Self { store }
    }

    /// Current cursor for `table`, corrected against the destination.
    ///
    /// When the stored value differs from the number of rows actually in the
    /// table, the actual count wins and is persisted. A cursor last written by
    /// [`CursorStore::reset`] or an operator is returned as stored, once: the
    /// next sync overwrites the marker. A cursor held by a run with record
    /// errors is honored the same way, so the failed batch is fetched again.
    /// If either lookup fails the cursor is reported as 0 so the next sync
    /// starts over instead of blocking.
    pub async fn get(&self, table: &str) -> u64 {
        match self.get_checked(table).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(
                    "Could not determine cursor for '{}', starting from 0: {:#}",
                    table,
                    e
                );
                0
            }
        }
    }

    async fn get_checked(&self, table: &str) -> Result<u64> {
        let record = self.store.load_cursor(table).await?;
        let stored = record.as_ref().map(|r| r.last_cursor).unwrap_or(0);

        let operator_override = record
            .as_ref()
            .and_then(|r| r.sync_run_id.as_deref())
            .is_some_and(|run| {
                run == RESET_RUN || run == MANUAL_RUN || run.starts_with(HELD_RUN_PREFIX)
            });
        if operator_override {
            return Ok(stored);
        }

        let actual = self.detect_actual(table).await?;

        if stored == actual {
            return Ok(stored);
        }

        tracing::warn!(
            "Cursor drift on '{}': stored {}, destination has {} rows; correcting",
            table,
            stored,
            actual
        );
        let marker = format!("{}-{}", SELF_CORRECTION_RUN, chrono::Utc::now().timestamp());
        self.store
            .save_cursor(table, actual, &marker)
            .await
            .with_context(|| format!("Failed to persist corrected cursor for '{}'", table))?;
        Ok(actual)
    }

    /// Store `value` as the cursor for `table`.
    pub async fn set(&self, table: &str, value: u64, run_id: &str) -> Result<()> {
        self.store.save_cursor(table, value, run_id).await?;
        tracing::debug!("Cursor for '{}' set to {} (run {})", table, value, run_id);
        Ok(())
    }

    /// Keep `table` at `value` after run `run_id` failed some records.
    pub async fn hold(&self, table: &str, value: u64, run_id: &str) -> Result<()> {
        let marker = format!("{}{}", HELD_RUN_PREFIX, run_id);
        self.store.save_cursor(table, value, &marker).await?;
        tracing::debug!("Cursor for '{}' held at {} (run {})", table, value, run_id);
        Ok(())
    }

    pub async fn reset(&self, table: &str) -> Result<()> {
        self.store.save_cursor(table, 0, RESET_RUN).await?;
        tracing::info!("Cursor for '{}' reset to 0", table);
        Ok(())
    }

    /// Number of rows currently in `table`; 0 when the table does not exist.
    pub async fn detect_actual(&self, table: &str) -> Result<u64> {
        if !self.store.table_exists(table).await? {
            return Ok(0);
        }
        let count = self
            .store
            .query_count(&Statement::CountRows {
                table: Ident::table(table)?,
            })
            .await
            .with_context(|| format!("Failed to count rows in '{}'", table))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Stored cursor record without correction.
    pub async fn record(&self, table: &str) -> Result<Option<CursorRecord>> {
        self.store.load_cursor(table).await
    }

    pub async fn list(&self) -> Result<Vec<CursorRecord>> {
        self.store.list_cursors().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqlValue};

    async fn seed(store: &MemoryStore, table: &str, rows: usize) {
        store.create_table(table, &[("id", "text")]);
        for i in 0..rows {
            store
                .execute(&Statement::Insert {
                    table: Ident::table(table).unwrap(),
                    values: vec![(Ident::column("id").unwrap(), SqlValue::Text(i.to_string()))],
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_reset_then_get_is_zero() {
        let store = MemoryStore::new();
        let cursors = CursorStore::new(&store);

        cursors.reset("invoice_item").await.unwrap();
        assert_eq!(cursors.get("invoice_item").await, 0);
    }

    #[tokio::test]
    async fn test_get_matches_stored_value() {
        let store = MemoryStore::new();
        seed(&store, "deals", 3).await;
        let cursors = CursorStore::new(&store);

        cursors.set("deals", 3, "run-1").await.unwrap();
        assert_eq!(cursors.get("deals").await, 3);
        assert_eq!(
            cursors.record("deals").await.unwrap().unwrap().sync_run_id.as_deref(),
            Some("run-1")
        );
    }

    #[tokio::test]
    async fn test_truncation_self_corrects_and_persists() {
        let store = MemoryStore::new();
        seed(&store, "deals", 5).await;
        let cursors = CursorStore::new(&store);
        cursors.set("deals", 5, "run-1").await.unwrap();

        store.truncate("deals");
        assert_eq!(cursors.get("deals").await, 0);

        let record = cursors.record("deals").await.unwrap().unwrap();
        assert_eq!(record.last_cursor, 0);
        assert!(record
            .sync_run_id
            .unwrap()
            .starts_with(SELF_CORRECTION_RUN));
    }

    #[tokio::test]
    async fn test_reset_is_honored_over_row_count() {
        let store = MemoryStore::new();
        seed(&store, "deals", 4).await;
        let cursors = CursorStore::new(&store);

        cursors.reset("deals").await.unwrap();
        assert_eq!(cursors.get("deals").await, 0);

        cursors.set("deals", 0, "run-2").await.unwrap();
        assert_eq!(cursors.get("deals").await, 4);
    }

    #[tokio::test]
    async fn test_held_cursor_is_not_corrected_forward() {
        let store = MemoryStore::new();
        seed(&store, "deals", 1).await;
        let cursors = CursorStore::new(&store);

        cursors.hold("deals", 0, "run-3").await.unwrap();
        assert_eq!(cursors.get("deals").await, 0);
        assert_eq!(
            cursors.record("deals").await.unwrap().unwrap().sync_run_id.as_deref(),
            Some("held:run-3")
        );

        cursors.set("deals", 0, "run-4").await.unwrap();
        assert_eq!(cursors.get("deals").await, 1);
    }

    #[tokio::test]
    async fn test_missing_table_counts_zero() {
        let store = MemoryStore::new();
        let cursors = CursorStore::new(&store);
        assert_eq!(cursors.detect_actual("nowhere").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_zero() {
        let store = MemoryStore::new();
        seed(&store, "deals", 2).await;
        let cursors = CursorStore::new(&store);
        cursors.set("deals", 2, "run-1").await.unwrap();

        store.set_unavailable(true);
        assert_eq!(cursors.get("deals").await, 0);
    }
}
