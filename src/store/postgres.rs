// ABOUTME: PostgreSQL destination store backed by tokio-postgres
// ABOUTME: Binds values per declared column type and persists cursors and schema patches

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use bytes::BytesMut;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, Row};

use super::records::{
    CursorRecord, NewPatchRequest, PatchKind, PatchRequest, PatchResolution, PatchStatus,
    SuggestedType,
};
use super::sql::{ColumnKind, Ident, SqlValue, Statement};
use super::{
    CursorRepository, DestinationStore, PatchRepository, StoreError, DATATYPE_MISMATCH,
    UNDEFINED_COLUMN, UNDEFINED_TABLE,
};

type ColumnTypes = Vec<(String, ColumnKind)>;

const PATCH_COLUMNS: &str = "id, table_name, field_name, original_field_name, patch_kind, \
     suggested_type, current_type, error_message, sync_run_id, status, created_at, \
     approved_at, approved_by, executed_at, execution_result, rejected_at, rejected_by, \
     rejection_reason";

/// Destination store writing to the connected database's current schema.
///
/// Column types are read from `information_schema` on first use and cached
/// per table. Schema alterations issued through [`DestinationStore::execute`]
/// drop the cached entry.
pub struct PgStore {
    client: Client,
    cursor_table: Ident,
    patch_table: Ident,
    column_cache: Mutex<HashMap<String, ColumnTypes>>,
}

impl PgStore {
    pub fn new(client: Client, cursor_table: &str, patch_table: &str) -> Result<Self> {
        Ok(Self {
            client,
            cursor_table: Ident::table(cursor_table)?,
            patch_table: Ident::table(patch_table)?,
            column_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Get a reference to the underlying client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Create the cursor and patch bookkeeping tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let cursor = self.cursor_table.quoted();
        let patch = self.patch_table.quoted();
        let pending_index = Ident::table(&format!("{}_one_pending", self.patch_table))
            .map(|i| i.quoted())
            .unwrap_or_else(|_| "\"pending_schema_patches_one_pending\"".to_string());

        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {cursor} (
                table_name TEXT PRIMARY KEY,
                last_cursor BIGINT NOT NULL DEFAULT 0 CHECK (last_cursor >= 0),
                last_sync_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                sync_run_id TEXT
            );

            CREATE TABLE IF NOT EXISTS {patch} (
                id BIGSERIAL PRIMARY KEY,
                table_name TEXT NOT NULL,
                field_name TEXT NOT NULL,
                original_field_name TEXT NOT NULL,
                patch_kind TEXT NOT NULL
                    CHECK (patch_kind IN ('add_column', 'alter_column_type')),
                suggested_type TEXT NOT NULL
                    CHECK (suggested_type IN ('timestamp', 'decimal', 'integer', 'boolean', 'text')),
                current_type TEXT,
                error_message TEXT NOT NULL,
                sync_run_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'approved', 'rejected', 'failed')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                approved_at TIMESTAMPTZ,
                approved_by TEXT,
                executed_at TIMESTAMPTZ,
                execution_result TEXT,
                rejected_at TIMESTAMPTZ,
                rejected_by TEXT,
                rejection_reason TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS {pending_index}
                ON {patch} (table_name, field_name)
                WHERE status = 'pending';
            "#
        );

        self.client
            .batch_execute(&ddl)
            .await
            .context("Failed to create bookkeeping tables")?;

        tracing::info!(
            "Bookkeeping tables ready: {} and {}",
            self.cursor_table,
            self.patch_table
        );
        Ok(())
    }

    fn cached_columns(&self, table: &str) -> Option<ColumnTypes> {
        self.column_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(table)
            .cloned()
    }

    fn invalidate_columns(&self, table: &str) {
        self.column_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(table);
    }

    /// Drop the cached columns of `table` when `err` says they no longer
    /// match the database: a missing column or table, or a type mismatch
    /// that may come from a type altered outside this process.
    fn forget_on_schema_error(&self, table: &str, err: StoreError) -> StoreError {
        if matches!(
            err.code(),
            Some(UNDEFINED_COLUMN | DATATYPE_MISMATCH | UNDEFINED_TABLE)
        ) {
            self.invalidate_columns(table);
        }
        err
    }

    async fn columns(&self, table: &str) -> Result<ColumnTypes, StoreError> {
        if let Some(columns) = self.cached_columns(table) {
            return Ok(columns);
        }

        let rows = self
            .client
            .query(
                "SELECT column_name::text, data_type::text, udt_name::text \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position",
                &[&table],
            )
            .await
            .map_err(map_pg_error)?;

        let columns: ColumnTypes = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                let udt_name: Option<String> = row.get(2);
                (name, ColumnKind::parse(&data_type, udt_name.as_deref()))
            })
            .collect();

        // A missing table is not cached; it may be created later.
        if !columns.is_empty() {
            self.column_cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(table.to_string(), columns.clone());
        }
        Ok(columns)
    }

    async fn bind_params(
        &self,
        statement: &Statement,
    ) -> Result<Vec<Box<dyn ToSql + Sync + Send>>, StoreError> {
        let params = statement.params();
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let columns = self.columns(statement.table().as_str()).await?;
        params
            .into_iter()
            .map(|(column, value)| {
                let kind = columns
                    .iter()
                    .find(|(name, _)| name == column.as_str())
                    .map(|(_, kind)| kind);
                bind_value(kind, column.as_str(), value.clone())
            })
            .collect()
    }

    async fn count(&self, statement: &Statement) -> Result<i64, StoreError> {
        let params = self.bind_params(statement).await?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();
        let row = self
            .client
            .query_one(&statement.to_sql(), &refs)
            .await
            .map_err(map_pg_error)?;
        Ok(row.get::<_, i64>(0))
    }
}

/// Convert a value to the Rust type tokio-postgres expects for the column.
///
/// Columns missing from the table bind the value's natural type so the
/// database reports the missing column itself.
fn bind_value(
    kind: Option<&ColumnKind>,
    column: &str,
    value: SqlValue,
) -> Result<Box<dyn ToSql + Sync + Send>, StoreError> {
    let Some(kind) = kind else {
        return Ok(bind_natural(value));
    };

    let value = kind.coerce(column, value)?;
    let boxed: Box<dyn ToSql + Sync + Send> = match kind {
        ColumnKind::SmallInt => {
            let val: Option<i16> = value.as_i64().and_then(|i| i16::try_from(i).ok());
            Box::new(val)
        }
        ColumnKind::Integer => {
            let val: Option<i32> = value.as_i64().and_then(|i| i32::try_from(i).ok());
            Box::new(val)
        }
        ColumnKind::BigInt => {
            let val: Option<i64> = value.as_i64();
            Box::new(val)
        }
        ColumnKind::Real => {
            let val: Option<f32> = value.as_f64().map(|f| f as f32);
            Box::new(val)
        }
        ColumnKind::Double => {
            let val: Option<f64> = value.as_f64();
            Box::new(val)
        }
        ColumnKind::Numeric => {
            let val: Option<Decimal> = value.as_decimal();
            Box::new(val)
        }
        ColumnKind::Boolean => {
            let val: Option<bool> = value.as_bool();
            Box::new(val)
        }
        ColumnKind::Timestamp => {
            let val: Option<chrono::NaiveDateTime> = value.as_timestamp().map(|ts| ts.naive_utc());
            Box::new(val)
        }
        ColumnKind::TimestampTz => {
            let val: Option<DateTime<Utc>> = value.as_timestamp();
            Box::new(val)
        }
        ColumnKind::Date => {
            let val: Option<chrono::NaiveDate> = value.as_timestamp().map(|ts| ts.date_naive());
            Box::new(val)
        }
        ColumnKind::TextArray => {
            let val: Option<Vec<String>> = value.to_text_array();
            Box::new(val)
        }
        ColumnKind::Json | ColumnKind::Jsonb => {
            let val: Option<serde_json::Value> = value.to_json();
            Box::new(val)
        }
        ColumnKind::Text => {
            let val: Option<String> = value.to_text();
            Box::new(val)
        }
        // Coercion only lets NULL through for these.
        ColumnKind::Other(_) => Box::new(UntypedNull),
    };
    Ok(boxed)
}

/// SQL NULL accepted for a parameter of any type.
#[derive(Debug)]
struct UntypedNull;

impl ToSql for UntypedNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_natural(value: SqlValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        SqlValue::Null => Box::new(None::<String>),
        SqlValue::Bool(b) => Box::new(b),
        SqlValue::Int(i) => Box::new(i),
        SqlValue::Float(f) => Box::new(f),
        SqlValue::Decimal(d) => Box::new(d),
        SqlValue::Text(s) => Box::new(s),
        SqlValue::Timestamp(ts) => Box::new(ts),
        SqlValue::TextArray(items) => Box::new(items),
        SqlValue::Json(v) => Box::new(v),
    }
}

fn map_pg_error(err: tokio_postgres::Error) -> StoreError {
    match err.as_db_error() {
        Some(db) => StoreError::Database {
            code: Some(db.code().code().to_string()),
            message: db.message().to_string(),
        },
        None => StoreError::Client(err.to_string()),
    }
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError> {
        let table = statement.table().as_str();

        if statement.is_ddl() {
            let result = self.client.batch_execute(&statement.to_sql()).await;
            self.invalidate_columns(table);
            result.map_err(map_pg_error)?;
            return Ok(0);
        }

        if matches!(
            statement,
            Statement::CountRows { .. } | Statement::CountWhereEq { .. }
        ) {
            return self
                .count(statement)
                .await
                .map(|n| n as u64)
                .map_err(|e| self.forget_on_schema_error(table, e));
        }

        let params = self
            .bind_params(statement)
            .await
            .map_err(|e| self.forget_on_schema_error(table, e))?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect();

        self.client
            .execute(&statement.to_sql(), &refs)
            .await
            .map_err(|e| self.forget_on_schema_error(table, map_pg_error(e)))
    }

    async fn query_count(&self, statement: &Statement) -> Result<i64, StoreError> {
        match statement {
            Statement::CountRows { .. } | Statement::CountWhereEq { .. } => self
                .count(statement)
                .await
                .map_err(|e| self.forget_on_schema_error(statement.table().as_str(), e)),
            _ => Err(StoreError::Client(
                "statement does not return a count".to_string(),
            )),
        }
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .columns(table)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (\
                     SELECT 1 FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_name = $1)",
                &[&table],
            )
            .await
            .map_err(map_pg_error)?;
        Ok(row.get::<_, bool>(0))
    }

    fn invalidate_table(&self, table: &str) {
        self.invalidate_columns(table);
    }
}

fn row_to_cursor(row: &Row) -> Result<CursorRecord> {
    let last_cursor: i64 = row.get("last_cursor");
    Ok(CursorRecord {
        table_name: row.get("table_name"),
        last_cursor: u64::try_from(last_cursor)
            .with_context(|| format!("Negative cursor value {} in store", last_cursor))?,
        last_sync_at: row.get("last_sync_at"),
        sync_run_id: row.get("sync_run_id"),
    })
}

#[async_trait]
impl CursorRepository for PgStore {
    async fn load_cursor(&self, table: &str) -> Result<Option<CursorRecord>> {
        let query = format!(
            "SELECT table_name, last_cursor, last_sync_at, sync_run_id FROM {} WHERE table_name = $1",
            self.cursor_table.quoted()
        );
        let row = self
            .client
            .query_opt(&query, &[&table])
            .await
            .with_context(|| format!("Failed to load cursor for '{}'", table))?;
        row.as_ref().map(row_to_cursor).transpose()
    }

    async fn save_cursor(&self, table: &str, value: u64, run_id: &str) -> Result<()> {
        let value = i64::try_from(value)
            .with_context(|| format!("Cursor value {} does not fit in BIGINT", value))?;
        let query = format!(
            "INSERT INTO {} (table_name, last_cursor, last_sync_at, sync_run_id) \
             VALUES ($1, $2, NOW(), $3) \
             ON CONFLICT (table_name) DO UPDATE SET \
                 last_cursor = EXCLUDED.last_cursor, \
                 last_sync_at = EXCLUDED.last_sync_at, \
                 sync_run_id = EXCLUDED.sync_run_id",
            self.cursor_table.quoted()
        );
        self.client
            .execute(&query, &[&table, &value, &run_id])
            .await
            .with_context(|| format!("Failed to save cursor for '{}'", table))?;
        Ok(())
    }

    async fn list_cursors(&self) -> Result<Vec<CursorRecord>> {
        let query = format!(
            "SELECT table_name, last_cursor, last_sync_at, sync_run_id FROM {} ORDER BY table_name",
            self.cursor_table.quoted()
        );
        let rows = self
            .client
            .query(&query, &[])
            .await
            .context("Failed to list cursors")?;
        rows.iter().map(row_to_cursor).collect()
    }
}

fn row_to_patch(row: &Row) -> Result<PatchRequest> {
    let kind: String = row.get("patch_kind");
    let suggested: String = row.get("suggested_type");
    let status: String = row.get("status");

    Ok(PatchRequest {
        id: row.get("id"),
        table_name: row.get("table_name"),
        field_name: row.get("field_name"),
        original_field_name: row.get("original_field_name"),
        kind: kind.parse::<PatchKind>()?,
        suggested_type: suggested.parse::<SuggestedType>()?,
        current_type: row.get("current_type"),
        error_message: row.get("error_message"),
        sync_run_id: row.get("sync_run_id"),
        status: status.parse::<PatchStatus>()?,
        created_at: row.get("created_at"),
        approved_at: row.get("approved_at"),
        approved_by: row.get("approved_by"),
        executed_at: row.get("executed_at"),
        execution_result: row.get("execution_result"),
        rejected_at: row.get("rejected_at"),
        rejected_by: row.get("rejected_by"),
        rejection_reason: row.get("rejection_reason"),
    })
}

#[async_trait]
impl PatchRepository for PgStore {
    async fn find_pending_patch(&self, table: &str, field: &str) -> Result<Option<PatchRequest>> {
        let query = format!(
            "SELECT {} FROM {} WHERE table_name = $1 AND field_name = $2 AND status = 'pending'",
            PATCH_COLUMNS,
            self.patch_table.quoted()
        );
        let row = self
            .client
            .query_opt(&query, &[&table, &field])
            .await
            .context("Failed to look up pending schema patch")?;
        row.as_ref().map(row_to_patch).transpose()
    }

    async fn insert_patch(&self, request: &NewPatchRequest) -> Result<Option<PatchRequest>> {
        let query = format!(
            "INSERT INTO {} (table_name, field_name, original_field_name, patch_kind, \
                 suggested_type, current_type, error_message, sync_run_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (table_name, field_name) WHERE status = 'pending' DO NOTHING \
             RETURNING {}",
            self.patch_table.quoted(),
            PATCH_COLUMNS
        );
        let row = self
            .client
            .query_opt(
                &query,
                &[
                    &request.table_name,
                    &request.field_name,
                    &request.original_field_name,
                    &request.kind.as_str(),
                    &request.suggested_type.as_str(),
                    &request.current_type,
                    &request.error_message,
                    &request.sync_run_id,
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to create schema patch for {}.{}",
                    request.table_name, request.field_name
                )
            })?;
        row.as_ref().map(row_to_patch).transpose()
    }

    async fn get_patch(&self, id: i64) -> Result<Option<PatchRequest>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            PATCH_COLUMNS,
            self.patch_table.quoted()
        );
        let row = self
            .client
            .query_opt(&query, &[&id])
            .await
            .with_context(|| format!("Failed to load schema patch {}", id))?;
        row.as_ref().map(row_to_patch).transpose()
    }

    async fn list_patches(
        &self,
        status: Option<PatchStatus>,
        table: Option<&str>,
    ) -> Result<Vec<PatchRequest>> {
        let query = format!(
            "SELECT {} FROM {} \
             WHERE ($1::text IS NULL OR status = $1) AND ($2::text IS NULL OR table_name = $2) \
             ORDER BY created_at, id",
            PATCH_COLUMNS,
            self.patch_table.quoted()
        );
        let status = status.map(|s| s.as_str());
        let rows = self
            .client
            .query(&query, &[&status, &table])
            .await
            .context("Failed to list schema patches")?;
        rows.iter().map(row_to_patch).collect()
    }

    async fn resolve_patch(&self, id: i64, resolution: &PatchResolution) -> Result<PatchRequest> {
        let mut patch = self
            .get_patch(id)
            .await?
            .ok_or_else(|| anyhow!("Schema patch {} not found", id))?;
        if patch.status != PatchStatus::Pending {
            bail!("Schema patch {} is already {}", id, patch.status);
        }
        resolution.apply_to(&mut patch, Utc::now());

        let query = format!(
            "UPDATE {} SET status = $2, approved_at = $3, approved_by = $4, executed_at = $5, \
                 execution_result = $6, rejected_at = $7, rejected_by = $8, rejection_reason = $9 \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {}",
            self.patch_table.quoted(),
            PATCH_COLUMNS
        );
        let row = self
            .client
            .query_opt(
                &query,
                &[
                    &id,
                    &patch.status.as_str(),
                    &patch.approved_at,
                    &patch.approved_by,
                    &patch.executed_at,
                    &patch.execution_result,
                    &patch.rejected_at,
                    &patch.rejected_by,
                    &patch.rejection_reason,
                ],
            )
            .await
            .with_context(|| format!("Failed to resolve schema patch {}", id))?;

        match row {
            Some(row) => row_to_patch(&row),
            None => bail!("Schema patch {} was resolved concurrently", id),
        }
    }
}
