// ABOUTME: Existence-checked insert-or-update of source records into a destination table
// ABOUTME: One pipeline for both full-refresh upserts and insert-only incremental syncs

use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use super::mapper::FieldMapper;
use super::schema_type::SchemaTypeCache;
use crate::source::SourceRecord;
use crate::store::{DestinationStore, Ident, SqlValue, Statement, StoreError};

/// How existing destination rows are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Update rows that already exist, insert the rest
    FullRefresh,
    /// Insert unseen records, never touch existing rows
    IncrementalInsertOnly,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::FullRefresh => f.write_str("full-refresh"),
            SyncMode::IncrementalInsertOnly => f.write_str("incremental"),
        }
    }
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Inserted,
    Updated,
    Skipped,
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("record has no external id in field '{0}'")]
    MissingExternalId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Writes records into one destination table.
pub struct UpsertEngine<'a, D: ?Sized> {
    store: &'a D,
    mapper: &'a FieldMapper,
    schema_cache: &'a SchemaTypeCache,
    id_field: &'a str,
    id_column: &'a Ident,
}

impl<'a, D> UpsertEngine<'a, D>
where
    D: DestinationStore + ?Sized,
{
    /// `id_field` names the source field holding the external id;
    /// `id_column` is the destination column it is stored in.
    pub fn new(
        store: &'a D,
        mapper: &'a FieldMapper,
        schema_cache: &'a SchemaTypeCache,
        id_field: &'a str,
        id_column: &'a Ident,
    ) -> Self {
        Self {
            store,
            mapper,
            schema_cache,
            id_field,
            id_column,
        }
    }

    /// Insert the record, or update every mapped column if it already exists.
    pub async fn upsert_one(
        &self,
        table: &Ident,
        record: &SourceRecord,
    ) -> Result<UpsertAction, UpsertError> {
        self.apply(SyncMode::FullRefresh, table, record).await
    }

    /// Insert the record only if no row carries its external id.
    pub async fn insert_if_new(
        &self,
        table: &Ident,
        record: &SourceRecord,
    ) -> Result<UpsertAction, UpsertError> {
        self.apply(SyncMode::IncrementalInsertOnly, table, record).await
    }

    pub async fn apply(
        &self,
        mode: SyncMode,
        table: &Ident,
        record: &SourceRecord,
    ) -> Result<UpsertAction, UpsertError> {
        let external_id = record
            .external_id(self.id_field)
            .ok_or_else(|| UpsertError::MissingExternalId(self.id_field.to_string()))?;
        let key_value = SqlValue::Text(external_id.clone());

        let exists = self
            .store
            .query_count(&Statement::CountWhereEq {
                table: table.clone(),
                key: self.id_column.clone(),
                key_value: key_value.clone(),
            })
            .await?
            > 0;

        if exists && mode == SyncMode::IncrementalInsertOnly {
            tracing::trace!("{} {} already present, skipping", table, external_id);
            return Ok(UpsertAction::Skipped);
        }

        let values = self.map_record(table, record).await?;

        if exists {
            if values.is_empty() {
                return Ok(UpsertAction::Updated);
            }
            self.store
                .execute(&Statement::UpdateWhereEq {
                    table: table.clone(),
                    key: self.id_column.clone(),
                    key_value,
                    assignments: values,
                })
                .await?;
            Ok(UpsertAction::Updated)
        } else {
            let mut row = Vec::with_capacity(values.len() + 1);
            row.push((self.id_column.clone(), key_value));
            row.extend(values);
            self.store
                .execute(&Statement::Insert {
                    table: table.clone(),
                    values: row,
                })
                .await?;
            Ok(UpsertAction::Inserted)
        }
    }

    /// Map every non-id field to a (column, value) pair.
    ///
    /// Fields whose column name is not a valid identifier are dropped, as are
    /// later fields that map onto a column already taken.
    async fn map_record(
        &self,
        table: &Ident,
        record: &SourceRecord,
    ) -> Result<Vec<(Ident, SqlValue)>, StoreError> {
        let convention = self.schema_cache.detect(self.store, table.as_str()).await?;

        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(self.id_column.as_str().to_string());

        let mut values = Vec::with_capacity(record.len());
        for (field, value) in record.fields() {
            if field == self.id_field {
                continue;
            }

            let column_name = FieldMapper::map_field(field, convention);
            let column = match Ident::column(&column_name) {
                Ok(column) => column,
                Err(e) => {
                    tracing::warn!("Dropping field '{}' from {}: {:#}", field, table, e);
                    continue;
                }
            };
            if !seen.insert(column_name) {
                tracing::warn!(
                    "Field '{}' maps onto column '{}' already set for this record; dropping it",
                    field,
                    column
                );
                continue;
            }

            values.push((column, self.mapper.coerce_value(value, field)));
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store: MemoryStore,
        mapper: FieldMapper,
        cache: SchemaTypeCache,
        id_column: Ident,
        table: Ident,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryStore::new();
            store.create_table(
                "deals",
                &[("id", "text"), ("deal_name", "text"), ("amount", "numeric")],
            );
            Self {
                store,
                mapper: FieldMapper::default(),
                cache: SchemaTypeCache::new(),
                id_column: Ident::column("id").unwrap(),
                table: Ident::table("deals").unwrap(),
            }
        }

        fn engine(&self) -> UpsertEngine<'_, MemoryStore> {
            UpsertEngine::new(&self.store, &self.mapper, &self.cache, "id", &self.id_column)
        }
    }

    fn record(value: serde_json::Value) -> SourceRecord {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_insert_if_new_skips_existing() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let r = record(json!({"id": "1", "Deal Name": "Acme", "amount": 10}));

        assert_eq!(
            engine.insert_if_new(&fx.table, &r).await.unwrap(),
            UpsertAction::Inserted
        );

        let changed = record(json!({"id": "1", "Deal Name": "Changed", "amount": 99}));
        assert_eq!(
            engine.insert_if_new(&fx.table, &changed).await.unwrap(),
            UpsertAction::Skipped
        );
        let row = fx.store.find_row("deals", "id", "1").unwrap();
        assert_eq!(row["deal_name"], SqlValue::Text("Acme".into()));
    }

    #[tokio::test]
    async fn test_upsert_one_updates_existing() {
        let fx = Fixture::new();
        let engine = fx.engine();

        engine
            .upsert_one(&fx.table, &record(json!({"id": "1", "amount": 10})))
            .await
            .unwrap();
        let action = engine
            .upsert_one(&fx.table, &record(json!({"id": "1", "amount": 25})))
            .await
            .unwrap();

        assert_eq!(action, UpsertAction::Updated);
        assert_eq!(fx.store.row_count("deals"), 1);
        let row = fx.store.find_row("deals", "id", "1").unwrap();
        assert_eq!(row["amount"], SqlValue::Decimal(25.into()));
    }

    #[tokio::test]
    async fn test_missing_external_id() {
        let fx = Fixture::new();
        let err = fx
            .engine()
            .insert_if_new(&fx.table, &record(json!({"amount": 10})))
            .await
            .unwrap_err();
        assert!(matches!(err, UpsertError::MissingExternalId(_)));
    }

    #[tokio::test]
    async fn test_missing_column_surfaces_store_error() {
        let fx = Fixture::new();
        let err = fx
            .engine()
            .insert_if_new(&fx.table, &record(json!({"id": "2", "Bonus Pct": 1.5})))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "column \"bonus_pct\" of relation \"deals\" does not exist"
        );
    }

    #[tokio::test]
    async fn test_invalid_column_name_is_dropped() {
        let fx = Fixture::new();
        fx.store.create_table("raw_deals", &[("id", "text"), ("Deal Name", "text")]);
        let table = Ident::table("raw_deals").unwrap();

        let action = fx
            .engine()
            .insert_if_new(
                &table,
                &record(json!({"id": "3", "Deal Name": "x", "bad\"name": "y"})),
            )
            .await
            .unwrap();
        assert_eq!(action, UpsertAction::Inserted);
    }
}
