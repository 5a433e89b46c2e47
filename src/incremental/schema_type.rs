// ABOUTME: Detects the column-naming convention of a destination table
// ABOUTME: Decisions are cached per table until explicitly invalidated

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::store::{DestinationStore, StoreError};

/// Column-naming style in effect for a destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Convention {
    /// Lowercase, underscore-separated column names
    Normalized,
    /// Column names are the source field names verbatim
    Raw,
}

impl Convention {
    /// Classify a table from its column names.
    ///
    /// Any column with a space or an uppercase letter means the table keeps
    /// source names verbatim.
    pub fn from_columns<S: AsRef<str>>(columns: &[S]) -> Self {
        let raw = columns.iter().any(|c| {
            c.as_ref()
                .chars()
                .any(|ch| ch == ' ' || ch.is_uppercase())
        });
        if raw {
            Convention::Raw
        } else {
            Convention::Normalized
        }
    }
}

impl fmt::Display for Convention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Convention::Normalized => f.write_str("normalized"),
            Convention::Raw => f.write_str("raw"),
        }
    }
}

/// Per-table convention cache owned by the sync pipeline.
///
/// Callers that drop or recreate a destination table must call
/// [`SchemaTypeCache::invalidate`], otherwise later mappings use the stale
/// decision.
#[derive(Debug, Default)]
pub struct SchemaTypeCache {
    decisions: Mutex<HashMap<String, Convention>>,
}

impl SchemaTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, table: &str) -> Option<Convention> {
        self.decisions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(table)
            .copied()
    }

    /// Detect the convention of `table`, consulting the cache first.
    ///
    /// A table with no columns yet is reported as normalized without caching
    /// the decision, so the first real columns decide.
    pub async fn detect<S>(&self, store: &S, table: &str) -> Result<Convention, StoreError>
    where
        S: DestinationStore + ?Sized,
    {
        if let Some(convention) = self.cached(table) {
            return Ok(convention);
        }

        let columns = store.column_names(table).await?;
        if columns.is_empty() {
            return Ok(Convention::Normalized);
        }

        let convention = Convention::from_columns(&columns);
        tracing::debug!("Table '{}' uses {} column names", table, convention);
        self.decisions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(table.to_string(), convention);
        Ok(convention)
    }

    /// Forget the decision for `table`, along with whatever `store` cached
    /// about its columns, so the next detection sees the table as it is now.
    pub fn invalidate<S>(&self, store: &S, table: &str)
    where
        S: DestinationStore + ?Sized,
    {
        self.decisions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(table);
        store.invalidate_table(table);
    }
}
