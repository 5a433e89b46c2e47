// ABOUTME: In-process destination store with PostgreSQL-shaped errors
// ABOUTME: Backs pipeline tests and dry runs without a database server

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::records::{CursorRecord, NewPatchRequest, PatchRequest, PatchResolution, PatchStatus};
use super::sql::{ColumnKind, Ident, SqlValue, Statement};
use super::{CursorRepository, DestinationStore, PatchRepository, StoreError};

type Row = HashMap<String, SqlValue>;

#[derive(Debug, Default)]
struct Table {
    columns: Vec<(String, ColumnKind)>,
    rows: Vec<Row>,
}

impl Table {
    fn kind_of(&self, column: &str) -> Option<&ColumnKind> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, kind)| kind)
    }

    fn matching(&self, key: &str, value: &SqlValue) -> impl Iterator<Item = usize> + '_ {
        let value = value.clone();
        let key = key.to_string();
        self.rows
            .iter()
            .enumerate()
            .filter(move |(_, row)| row.get(&key) == Some(&value))
            .map(|(idx, _)| idx)
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<String, Table>,
    cursors: BTreeMap<String, CursorRecord>,
    patches: Vec<PatchRequest>,
    next_patch_id: i64,
}

/// Destination store kept entirely in memory.
///
/// Column types are enforced with the same coercion rules as the PostgreSQL
/// store, and failures use PostgreSQL's messages, so schema-drift handling
/// behaves identically against either backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Client("connection refused".to_string()));
        }
        Ok(())
    }

    /// Create (or replace) a table. Types use PostgreSQL names, e.g. `text[]`.
    pub fn create_table(&self, name: &str, columns: &[(&str, &str)]) {
        let table = Table {
            columns: columns
                .iter()
                .map(|(col, ty)| (col.to_string(), ColumnKind::parse(ty, None)))
                .collect(),
            rows: Vec::new(),
        };
        self.lock().tables.insert(name.to_string(), table);
    }

    pub fn drop_table(&self, name: &str) {
        self.lock().tables.remove(name);
    }

    /// Delete every row, keeping the columns.
    pub fn truncate(&self, name: &str) {
        if let Some(table) = self.lock().tables.get_mut(name) {
            table.rows.clear();
        }
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.lock()
            .tables
            .get(name)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Fetch the first row whose `key` column equals `value`.
    pub fn find_row(&self, table: &str, key: &str, value: &str) -> Option<HashMap<String, SqlValue>> {
        let inner = self.lock();
        let table = inner.tables.get(table)?;
        let needle = SqlValue::Text(value.to_string());
        let idx = table.matching(key, &needle).next()?;
        Some(table.rows[idx].clone())
    }

    /// Type of a column, if present.
    pub fn column_kind(&self, table: &str, column: &str) -> Option<ColumnKind> {
        self.lock().tables.get(table)?.kind_of(column).cloned()
    }

    /// Simulate the store becoming unreachable (every call fails).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn coerce_all(
        table_name: &Ident,
        table: &Table,
        values: &[(Ident, SqlValue)],
    ) -> Result<Vec<(String, SqlValue)>, StoreError> {
        values
            .iter()
            .map(|(column, value)| {
                let kind = table.kind_of(column.as_str()).ok_or_else(|| {
                    StoreError::undefined_column(column.as_str(), table_name.as_str())
                })?;
                let coerced = kind.coerce(column.as_str(), value.clone())?;
                Ok((column.to_string(), coerced))
            })
            .collect()
    }

    fn coerce_key(
        table_name: &Ident,
        table: &Table,
        key: &Ident,
        value: &SqlValue,
    ) -> Result<SqlValue, StoreError> {
        let kind = table
            .kind_of(key.as_str())
            .ok_or_else(|| StoreError::undefined_column(key.as_str(), table_name.as_str()))?;
        kind.coerce(key.as_str(), value.clone())
    }

    fn count(inner: &Inner, statement: &Statement) -> Result<i64, StoreError> {
        let table_name = statement.table();
        let table = inner
            .tables
            .get(table_name.as_str())
            .ok_or_else(|| StoreError::undefined_table(table_name.as_str()))?;
        match statement {
            Statement::CountRows { .. } => Ok(table.rows.len() as i64),
            Statement::CountWhereEq { key, key_value, .. } => {
                let key_value = Self::coerce_key(table_name, table, key, key_value)?;
                Ok(table.matching(key.as_str(), &key_value).count() as i64)
            }
            _ => Err(StoreError::Client(
                "statement does not return a count".to_string(),
            )),
        }
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();

        let table_name = statement.table().clone();
        if matches!(
            statement,
            Statement::CountRows { .. } | Statement::CountWhereEq { .. }
        ) {
            return Self::count(&inner, statement).map(|n| n as u64);
        }

        let table = inner
            .tables
            .get_mut(table_name.as_str())
            .ok_or_else(|| StoreError::undefined_table(table_name.as_str()))?;

        match statement {
            Statement::Insert { values, .. } => {
                let row: Row = Self::coerce_all(&table_name, table, values)?
                    .into_iter()
                    .collect();
                table.rows.push(row);
                Ok(1)
            }
            Statement::UpdateWhereEq {
                key,
                key_value,
                assignments,
                ..
            } => {
                let assignments = Self::coerce_all(&table_name, table, assignments)?;
                let key_value = Self::coerce_key(&table_name, table, key, key_value)?;
                let targets: Vec<usize> = table.matching(key.as_str(), &key_value).collect();
                for idx in &targets {
                    for (column, value) in &assignments {
                        table.rows[*idx].insert(column.clone(), value.clone());
                    }
                }
                Ok(targets.len() as u64)
            }
            Statement::AddColumn { column, kind, .. } => {
                if table.kind_of(column.as_str()).is_none() {
                    table.columns.push((column.to_string(), kind.clone()));
                }
                Ok(0)
            }
            Statement::AlterColumnType { column, kind, .. } => {
                if table.kind_of(column.as_str()).is_none() {
                    return Err(StoreError::undefined_column(
                        column.as_str(),
                        table_name.as_str(),
                    ));
                }
                let mut converted = Vec::with_capacity(table.rows.len());
                for row in &table.rows {
                    let value = row.get(column.as_str()).cloned().unwrap_or(SqlValue::Null);
                    converted.push(kind.coerce(column.as_str(), value)?);
                }
                for (row, value) in table.rows.iter_mut().zip(converted) {
                    row.insert(column.to_string(), value);
                }
                for (name, existing) in table.columns.iter_mut() {
                    if name == column.as_str() {
                        *existing = kind.clone();
                    }
                }
                Ok(0)
            }
            Statement::CountRows { .. } | Statement::CountWhereEq { .. } => Ok(0),
        }
    }

    async fn query_count(&self, statement: &Statement) -> Result<i64, StoreError> {
        self.check_available()?;
        let inner = self.lock();
        Self::count(&inner, statement)
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .tables
            .get(table)
            .map(|t| t.columns.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.lock().tables.contains_key(table))
    }
}

#[async_trait]
impl CursorRepository for MemoryStore {
    async fn load_cursor(&self, table: &str) -> Result<Option<CursorRecord>> {
        self.check_available()?;
        Ok(self.lock().cursors.get(table).cloned())
    }

    async fn save_cursor(&self, table: &str, value: u64, run_id: &str) -> Result<()> {
        self.check_available()?;
        self.lock().cursors.insert(
            table.to_string(),
            CursorRecord {
                table_name: table.to_string(),
                last_cursor: value,
                last_sync_at: Utc::now(),
                sync_run_id: Some(run_id.to_string()),
            },
        );
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<CursorRecord>> {
        self.check_available()?;
        Ok(self.lock().cursors.values().cloned().collect())
    }
}

#[async_trait]
impl PatchRepository for MemoryStore {
    async fn find_pending_patch(&self, table: &str, field: &str) -> Result<Option<PatchRequest>> {
        self.check_available()?;
        Ok(self
            .lock()
            .patches
            .iter()
            .find(|p| {
                p.status == PatchStatus::Pending && p.table_name == table && p.field_name == field
            })
            .cloned())
    }

    async fn insert_patch(&self, request: &NewPatchRequest) -> Result<Option<PatchRequest>> {
        self.check_available()?;
        let mut inner = self.lock();
        let duplicate = inner.patches.iter().any(|p| {
            p.status == PatchStatus::Pending
                && p.table_name == request.table_name
                && p.field_name == request.field_name
        });
        if duplicate {
            return Ok(None);
        }

        inner.next_patch_id += 1;
        let patch = PatchRequest::from_new(inner.next_patch_id, request, Utc::now());
        inner.patches.push(patch.clone());
        Ok(Some(patch))
    }

    async fn get_patch(&self, id: i64) -> Result<Option<PatchRequest>> {
        self.check_available()?;
        Ok(self.lock().patches.iter().find(|p| p.id == id).cloned())
    }

    async fn list_patches(
        &self,
        status: Option<PatchStatus>,
        table: Option<&str>,
    ) -> Result<Vec<PatchRequest>> {
        self.check_available()?;
        Ok(self
            .lock()
            .patches
            .iter()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .filter(|p| table.map_or(true, |t| p.table_name == t))
            .cloned()
            .collect())
    }

    async fn resolve_patch(&self, id: i64, resolution: &PatchResolution) -> Result<PatchRequest> {
        self.check_available()?;
        let mut inner = self.lock();
        let patch = inner
            .patches
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow!("Schema patch {} not found", id))?;
        if patch.status != PatchStatus::Pending {
            bail!("Schema patch {} is already {}", id, patch.status);
        }
        resolution.apply_to(patch, Utc::now());
        Ok(patch.clone())
    }
}
