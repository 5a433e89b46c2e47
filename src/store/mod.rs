// ABOUTME: Destination store contracts used by the synchronization core
// ABOUTME: Statement execution, column introspection, cursor and patch persistence

pub mod memory;
pub mod postgres;
pub mod records;
pub mod sql;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use records::{
    CursorRecord, NewPatchRequest, PatchKind, PatchRequest, PatchResolution, PatchStatus,
    SuggestedType,
};
pub use sql::{ColumnKind, Ident, SqlValue, Statement};

/// SQLSTATE for `undefined_column`.
pub const UNDEFINED_COLUMN: &str = "42703";
/// SQLSTATE for `datatype_mismatch`.
pub const DATATYPE_MISMATCH: &str = "42804";
/// SQLSTATE for `undefined_table`.
pub const UNDEFINED_TABLE: &str = "42P01";

/// Failure reported by the destination store.
///
/// Messages follow PostgreSQL's wording regardless of which store produced
/// them, so schema errors can be recognized from the text alone.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store executed the statement and rejected it
    #[error("{message}")]
    Database {
        code: Option<String>,
        message: String,
    },
    /// A value could not be bound to the target column's type
    #[error("column \"{column}\" is of type {column_type} but expression is of type {expression_type}")]
    TypeMismatch {
        column: String,
        column_type: String,
        expression_type: String,
    },
    /// The statement never reached the store (connection, protocol, encoding)
    #[error("destination store error: {0}")]
    Client(String),
}

impl StoreError {
    pub fn undefined_column(column: &str, relation: &str) -> Self {
        StoreError::Database {
            code: Some(UNDEFINED_COLUMN.to_string()),
            message: format!(
                "column \"{}\" of relation \"{}\" does not exist",
                column, relation
            ),
        }
    }

    pub fn undefined_table(relation: &str) -> Self {
        StoreError::Database {
            code: Some(UNDEFINED_TABLE.to_string()),
            message: format!("relation \"{}\" does not exist", relation),
        }
    }

    /// SQLSTATE code, when the store reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Database { code, .. } => code.as_deref(),
            StoreError::TypeMismatch { .. } => Some(DATATYPE_MISMATCH),
            StoreError::Client(_) => None,
        }
    }
}

/// Statement execution and introspection against the destination tables.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64, StoreError>;

    /// Run a `COUNT(*)` statement and return the count.
    async fn query_count(&self, statement: &Statement) -> Result<i64, StoreError>;

    /// Column names of `table` in ordinal order; empty when the table is missing.
    async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError>;

    /// Whether `table` exists.
    async fn table_exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Forget anything cached about the shape of `table`.
    ///
    /// Called when a table may have been dropped, recreated or altered
    /// outside the store's own statements.
    fn invalidate_table(&self, _table: &str) {}
}

/// Durable storage of per-table cursor records.
#[async_trait]
pub trait CursorRepository: Send + Sync {
    async fn load_cursor(&self, table: &str) -> Result<Option<CursorRecord>>;

    /// Insert or overwrite the cursor for `table`, stamping the current time.
    async fn save_cursor(&self, table: &str, value: u64, run_id: &str) -> Result<()>;

    async fn list_cursors(&self) -> Result<Vec<CursorRecord>>;
}

/// Durable storage of schema patch requests.
#[async_trait]
pub trait PatchRepository: Send + Sync {
    /// The pending request for (`table`, `field`), if one exists.
    async fn find_pending_patch(&self, table: &str, field: &str) -> Result<Option<PatchRequest>>;

    /// Persist a new pending request.
    ///
    /// Returns `None` when a pending request for the same (table, field)
    /// already exists; at most one may be pending per pair.
    async fn insert_patch(&self, request: &NewPatchRequest) -> Result<Option<PatchRequest>>;

    async fn get_patch(&self, id: i64) -> Result<Option<PatchRequest>>;

    /// Requests filtered by status and/or table, oldest first.
    async fn list_patches(
        &self,
        status: Option<PatchStatus>,
        table: Option<&str>,
    ) -> Result<Vec<PatchRequest>>;

    /// Move a pending request to its terminal state.
    ///
    /// Fails if the request does not exist or is no longer pending.
    async fn resolve_patch(&self, id: i64, resolution: &PatchResolution) -> Result<PatchRequest>;
}

/// Everything the synchronization core needs from the destination side.
pub trait Destination: DestinationStore + CursorRepository + PatchRepository {}

impl<T> Destination for T where T: DestinationStore + CursorRepository + PatchRepository {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined_column_message() {
        let err = StoreError::undefined_column("bonus_pct", "agent_perf");
        assert_eq!(
            err.to_string(),
            "column \"bonus_pct\" of relation \"agent_perf\" does not exist"
        );
        assert_eq!(err.code(), Some(UNDEFINED_COLUMN));
    }

    #[test]
    fn test_type_mismatch_code() {
        let err = StoreError::TypeMismatch {
            column: "calls".into(),
            column_type: "integer".into(),
            expression_type: "text".into(),
        };
        assert_eq!(err.code(), Some(DATATYPE_MISMATCH));
    }
}
