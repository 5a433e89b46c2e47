// ABOUTME: End-to-end sync pipeline tests against the in-process store and source
// ABOUTME: Cursor advance, idempotence, self-correction and schema patch recovery

use api_replicator::incremental::{
    FieldMapper, SyncOptions, SyncOrchestrator, SyncPhase, SyncReport,
};
use api_replicator::source::{MemorySource, SourceRecord};
use api_replicator::store::{
    ColumnKind, Ident, MemoryStore, PatchKind, PatchStatus, SqlValue, Statement, SuggestedType,
};
use api_replicator::store::{DestinationStore, PatchRepository};
use serde_json::{json, Value};
use std::time::Duration;

type Pipeline = SyncOrchestrator<MemorySource, MemoryStore>;

fn external_id(i: u64) -> String {
    format!("{:013}_{:015}", 1_700_000_000_000u64 + i, i)
}

fn record(value: Value) -> SourceRecord {
    serde_json::from_value(value).expect("record literal must be an object")
}

fn invoice_items(range: std::ops::Range<u64>) -> Vec<SourceRecord> {
    range
        .map(|i| {
            record(json!({
                "id": external_id(i),
                "Description": format!("item {}", i),
                "Amount": i as f64 * 1.5,
                "Created At": "2024-03-01T12:00:00.000Z",
            }))
        })
        .collect()
}

fn pipeline(source: MemorySource, store: MemoryStore) -> Pipeline {
    let options = SyncOptions {
        inter_batch_delay: Duration::ZERO,
        ..SyncOptions::default()
    };
    SyncOrchestrator::new(source, store, FieldMapper::default(), options)
}

fn invoice_store() -> MemoryStore {
    let store = MemoryStore::new();
    store.create_table(
        "invoice_item",
        &[
            ("id", "text"),
            ("description", "text"),
            ("amount", "numeric"),
            ("created_at", "timestamp with time zone"),
        ],
    );
    store
}

async fn preload(store: &MemoryStore, table: &str, ids: std::ops::Range<u64>) {
    for i in ids {
        store
            .execute(&Statement::Insert {
                table: Ident::table(table).unwrap(),
                values: vec![(Ident::column("id").unwrap(), SqlValue::Text(external_id(i)))],
            })
            .await
            .expect("preload insert");
    }
}

fn assert_counts(report: &SyncReport, new: u64, skipped: u64, errors: u64) {
    assert_eq!(report.new_records, new, "new records");
    assert_eq!(report.skipped, skipped, "skipped");
    assert_eq!(report.errors, errors, "errors");
}

#[tokio::test]
async fn test_incremental_sync_advances_from_existing_cursor() {
    let source = MemorySource::new(100);
    source.set_records("invoice_item", invoice_items(0..3950));
    let store = invoice_store();
    preload(&store, "invoice_item", 0..3900).await;

    let pipeline = pipeline(source, store);
    pipeline
        .cursors()
        .set("invoice_item", 3900, "seed")
        .await
        .unwrap();

    let report = pipeline
        .run_incremental_sync("invoice_item", 10)
        .await
        .unwrap();

    assert_counts(&report, 10, 0, 0);
    assert_eq!(report.synced, 10);
    assert_eq!(report.previous_cursor, 3900);
    assert_eq!(report.new_cursor, 3910);
    assert!(report.cursor_updated);
    assert_eq!(report.phase, SyncPhase::Done);

    assert_eq!(
        pipeline.source().requests(),
        vec![("invoice_item".to_string(), 3900, 10)]
    );
    assert_eq!(pipeline.cursors().get("invoice_item").await, 3910);

    let row = pipeline
        .store()
        .find_row("invoice_item", "id", &external_id(3905))
        .unwrap();
    assert_eq!(row["description"], SqlValue::Text("item 3905".into()));
    assert_eq!(row["amount"], SqlValue::Decimal("5857.5".parse().unwrap()));
    assert!(matches!(row["created_at"], SqlValue::Timestamp(_)));
}

#[tokio::test]
async fn test_second_run_on_unchanged_source_brings_nothing_new() {
    let source = MemorySource::new(100);
    source.set_records("invoice_item", invoice_items(0..25));
    let pipeline = pipeline(source, invoice_store());

    let first = pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    assert_counts(&first, 25, 0, 0);
    assert_eq!(first.new_cursor, 25);

    let second = pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    assert_counts(&second, 0, 0, 0);
    assert_eq!(second.previous_cursor, 25);
    assert_eq!(second.new_cursor, 25);
    assert_eq!(pipeline.store().row_count("invoice_item"), 25);

    pipeline
        .source()
        .push_records("invoice_item", invoice_items(25..30));
    let third = pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    assert_counts(&third, 5, 0, 0);
    assert_eq!(third.new_cursor, 30);
}

#[tokio::test]
async fn test_resync_after_reset_skips_existing_rows() {
    let source = MemorySource::new(100);
    source.set_records("invoice_item", invoice_items(0..25));
    let pipeline = pipeline(source, invoice_store());

    pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    pipeline.cursors().reset("invoice_item").await.unwrap();
    assert_eq!(pipeline.cursors().get("invoice_item").await, 0);

    let rerun = pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    assert_counts(&rerun, 0, 25, 0);
    assert_eq!(pipeline.store().row_count("invoice_item"), 25);

    // The rerun's cursor write replaced the reset marker, so drift is corrected again.
    assert_eq!(pipeline.cursors().get("invoice_item").await, 25);
}

#[tokio::test]
async fn test_truncated_destination_restarts_from_zero() {
    let source = MemorySource::new(100);
    source.set_records("invoice_item", invoice_items(0..30));
    let pipeline = pipeline(source, invoice_store());

    pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    pipeline.store().truncate("invoice_item");

    assert_eq!(pipeline.cursors().get("invoice_item").await, 0);
    let stored = pipeline
        .cursors()
        .record("invoice_item")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.last_cursor, 0);

    let report = pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    assert_eq!(report.previous_cursor, 0);
    assert_counts(&report, 30, 0, 0);
    assert_eq!(report.new_cursor, 30);
}

#[tokio::test]
async fn test_missing_column_patch_approved_then_sync_succeeds() {
    let source = MemorySource::new(100);
    source.set_records(
        "agent_perf",
        vec![
            record(json!({"id": external_id(1), "Agent Name": "Ana", "bonus_pct": 12.5})),
            record(json!({"id": external_id(2), "Agent Name": "Bo", "bonus_pct": 7})),
        ],
    );
    let store = MemoryStore::new();
    store.create_table("agent_perf", &[("id", "text"), ("agent_name", "text")]);
    let pipeline = pipeline(source, store);

    let failed = pipeline
        .run_incremental_sync("agent_perf", 100)
        .await
        .unwrap();
    assert_counts(&failed, 0, 0, 2);
    assert!(!failed.cursor_updated);
    assert_eq!(failed.new_cursor, failed.previous_cursor);
    assert_eq!(failed.patches_created, 1);

    let pending = pipeline.patches().list_pending(Some("agent_perf")).await.unwrap();
    assert_eq!(pending.len(), 1);
    let patch = &pending[0];
    assert_eq!(patch.field_name, "bonus_pct");
    assert_eq!(patch.kind, PatchKind::AddColumn);
    assert_eq!(patch.suggested_type, SuggestedType::Decimal);
    assert_eq!(
        patch.error_message,
        "column \"bonus_pct\" of relation \"agent_perf\" does not exist"
    );
    assert_eq!(patch.sync_run_id.as_deref(), Some(failed.run_id.as_str()));

    let approved = pipeline
        .patches()
        .approve(patch.id, "ops@example.com")
        .await
        .unwrap();
    assert_eq!(approved.status, PatchStatus::Approved);
    assert_eq!(
        pipeline.store().column_kind("agent_perf", "bonus_pct"),
        Some(ColumnKind::Numeric)
    );

    let retried = pipeline
        .run_incremental_sync("agent_perf", 100)
        .await
        .unwrap();
    assert_counts(&retried, 2, 0, 0);
    assert_eq!(retried.new_cursor, 2);

    let row = pipeline
        .store()
        .find_row("agent_perf", "id", &external_id(1))
        .unwrap();
    assert_eq!(row["bonus_pct"], SqlValue::Decimal("12.5".parse().unwrap()));
}

#[tokio::test]
async fn test_failed_record_is_retried_after_approval() {
    let source = MemorySource::new(100);
    source.set_records(
        "agent_perf",
        vec![
            record(json!({"id": external_id(1), "bonus_pct": 2.5})),
            record(json!({"id": external_id(2)})),
        ],
    );
    let store = MemoryStore::new();
    store.create_table("agent_perf", &[("id", "text")]);
    let pipeline = pipeline(source, store);

    let partial = pipeline
        .run_incremental_sync("agent_perf", 100)
        .await
        .unwrap();
    assert_counts(&partial, 1, 0, 1);
    assert!(!partial.cursor_updated);

    // One row landed, but the failed batch must be read again.
    assert_eq!(pipeline.store().row_count("agent_perf"), 1);
    assert_eq!(pipeline.cursors().get("agent_perf").await, 0);

    let patch = pipeline
        .store()
        .find_pending_patch("agent_perf", "bonus_pct")
        .await
        .unwrap()
        .expect("a pending patch for bonus_pct");
    pipeline.patches().approve(patch.id, "ops").await.unwrap();

    let retried = pipeline
        .run_incremental_sync("agent_perf", 100)
        .await
        .unwrap();
    assert_eq!(retried.previous_cursor, 0);
    assert_counts(&retried, 1, 1, 0);
    assert!(retried.cursor_updated);

    let row = pipeline
        .store()
        .find_row("agent_perf", "id", &external_id(1))
        .expect("the previously failed record is synced");
    assert_eq!(row["bonus_pct"], SqlValue::Decimal("2.5".parse().unwrap()));
    assert_eq!(pipeline.store().row_count("agent_perf"), 2);
    assert_eq!(pipeline.cursors().get("agent_perf").await, 2);
}

#[tokio::test]
async fn test_unbindable_column_type_gets_widening_patch() {
    let source = MemorySource::new(100);
    source.set_records(
        "deals",
        vec![
            record(json!({"id": external_id(1), "external_ref": null})),
            record(json!({"id": external_id(2), "external_ref": "crm-77"})),
        ],
    );
    let store = MemoryStore::new();
    store.create_table("deals", &[("id", "text"), ("external_ref", "uuid")]);
    let pipeline = pipeline(source, store);

    let failed = pipeline.run_incremental_sync("deals", 100).await.unwrap();
    assert_counts(&failed, 1, 0, 1);
    assert_eq!(failed.patches_created, 1);

    let patch = pipeline
        .store()
        .find_pending_patch("deals", "external_ref")
        .await
        .unwrap()
        .expect("a pending patch for external_ref");
    assert_eq!(patch.kind, PatchKind::AlterColumnType);
    assert_eq!(patch.current_type.as_deref(), Some("uuid"));
    assert_eq!(patch.suggested_type, SuggestedType::Text);

    pipeline.patches().approve(patch.id, "ops").await.unwrap();
    let retried = pipeline.run_incremental_sync("deals", 100).await.unwrap();
    assert_counts(&retried, 1, 1, 0);

    let row = pipeline
        .store()
        .find_row("deals", "id", &external_id(2))
        .unwrap();
    assert_eq!(row["external_ref"], SqlValue::Text("crm-77".into()));
}

#[tokio::test]
async fn test_type_mismatch_widens_column() {
    let source = MemorySource::new(100);
    source.set_records(
        "agent_perf",
        vec![record(json!({"id": external_id(1), "calls": 2.5}))],
    );
    let store = MemoryStore::new();
    store.create_table("agent_perf", &[("id", "text"), ("calls", "integer")]);
    let pipeline = pipeline(source, store);

    let failed = pipeline
        .run_incremental_sync("agent_perf", 100)
        .await
        .unwrap();
    assert_eq!(failed.errors, 1);

    let patch = pipeline
        .store()
        .find_pending_patch("agent_perf", "calls")
        .await
        .unwrap()
        .expect("a pending patch for calls");
    assert_eq!(patch.kind, PatchKind::AlterColumnType);
    assert_eq!(patch.current_type.as_deref(), Some("integer"));
    assert_eq!(patch.suggested_type, SuggestedType::Decimal);

    pipeline.patches().approve(patch.id, "ops").await.unwrap();
    let retried = pipeline
        .run_incremental_sync("agent_perf", 100)
        .await
        .unwrap();
    assert_counts(&retried, 1, 0, 0);
}

#[tokio::test]
async fn test_repeated_failures_keep_a_single_pending_patch() {
    let source = MemorySource::new(100);
    source.set_records(
        "agent_perf",
        vec![record(json!({"id": external_id(1), "bonus_pct": 1.0}))],
    );
    let store = MemoryStore::new();
    store.create_table("agent_perf", &[("id", "text")]);
    let pipeline = pipeline(source, store);

    for _ in 0..3 {
        pipeline
            .run_incremental_sync("agent_perf", 100)
            .await
            .unwrap();
    }

    let all = pipeline
        .store()
        .list_patches(None, Some("agent_perf"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_fetch_failure_aborts_without_touching_cursor() {
    let source = MemorySource::new(100);
    source.set_records("invoice_item", invoice_items(0..300));
    source.fail_from(Some(100));
    let pipeline = pipeline(source, invoice_store());

    let result = pipeline.run_incremental_sync("invoice_item", 250).await;
    assert!(result.is_err());

    assert_eq!(pipeline.store().row_count("invoice_item"), 0);
    assert!(pipeline
        .cursors()
        .record("invoice_item")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_record_without_id_blocks_cursor_advance() {
    let source = MemorySource::new(100);
    source.set_records(
        "invoice_item",
        vec![
            record(json!({"id": external_id(1), "Description": "ok"})),
            record(json!({"Description": "no id"})),
        ],
    );
    let pipeline = pipeline(source, invoice_store());

    let report = pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();
    assert_counts(&report, 1, 0, 1);
    assert_eq!(report.patches_created, 0);
    assert!(!report.cursor_updated);
    assert_eq!(report.final_cursor, 2);

    // The synced row must not pull the cursor past the rejected record.
    assert_eq!(pipeline.store().row_count("invoice_item"), 1);
    assert_eq!(pipeline.cursors().get("invoice_item").await, 0);
}

#[tokio::test]
async fn test_full_refresh_updates_rows_and_never_lowers_cursor() {
    let source = MemorySource::new(100);
    source.set_records("invoice_item", invoice_items(0..40));
    let pipeline = pipeline(source, invoice_store());

    pipeline
        .run_incremental_sync("invoice_item", 100)
        .await
        .unwrap();

    let changed = (0..10)
        .map(|i| record(json!({"id": external_id(i), "Description": "refreshed"})))
        .collect();
    pipeline.source().set_records("invoice_item", changed);

    let report = pipeline.run_full_refresh("invoice_item", 100).await.unwrap();
    assert_eq!(report.synced, 10);
    assert_eq!(report.new_records, 0);
    assert_eq!(report.previous_cursor, 40);
    assert_eq!(report.new_cursor, 40);
    assert_eq!(pipeline.source().requests().last().unwrap().1, 0);

    let row = pipeline
        .store()
        .find_row("invoice_item", "id", &external_id(3))
        .unwrap();
    assert_eq!(row["description"], SqlValue::Text("refreshed".into()));
}

#[tokio::test]
async fn test_relationship_and_opaque_arrays() {
    let source = MemorySource::new(100);
    source.set_records(
        "deals",
        vec![record(json!({
            "id": external_id(1),
            "linked_contacts": [external_id(10), external_id(11)],
            "tags": ["hot", "q3"],
            "meta": {"source": "import"},
            "empty_list": [],
        }))],
    );
    let store = MemoryStore::new();
    store.create_table(
        "deals",
        &[
            ("id", "text"),
            ("linked_contacts", "text[]"),
            ("tags", "jsonb"),
            ("meta", "text"),
            ("empty_list", "text[]"),
        ],
    );
    let pipeline = pipeline(source, store);

    let report = pipeline.run_incremental_sync("deals", 10).await.unwrap();
    assert_counts(&report, 1, 0, 0);

    let row = pipeline
        .store()
        .find_row("deals", "id", &external_id(1))
        .unwrap();
    assert_eq!(
        row["linked_contacts"],
        SqlValue::TextArray(vec![external_id(10), external_id(11)])
    );
    assert_eq!(row["tags"], SqlValue::Json(json!(["hot", "q3"])));
    assert_eq!(row["meta"], SqlValue::Text(r#"{"source":"import"}"#.into()));
    assert_eq!(row["empty_list"], SqlValue::Null);
}

#[tokio::test]
async fn test_raw_convention_keeps_source_names() {
    let source = MemorySource::new(100);
    source.set_records(
        "payments",
        vec![record(json!({
            "id": external_id(1),
            "Customer Name": "Acme",
            "2nd Payment %": 40,
        }))],
    );
    let store = MemoryStore::new();
    store.create_table(
        "payments",
        &[
            ("id", "text"),
            ("Customer Name", "text"),
            ("2nd Payment %", "numeric"),
        ],
    );
    let pipeline = pipeline(source, store);

    let report = pipeline.run_incremental_sync("payments", 10).await.unwrap();
    assert_counts(&report, 1, 0, 0);

    let row = pipeline
        .store()
        .find_row("payments", "id", &external_id(1))
        .unwrap();
    assert_eq!(row["Customer Name"], SqlValue::Text("Acme".into()));
    assert_eq!(row["2nd Payment %"], SqlValue::Decimal(40.into()));
}

#[tokio::test]
async fn test_recreated_table_needs_cache_invalidation() {
    let source = MemorySource::new(100);
    source.set_records(
        "contacts",
        vec![record(json!({"id": external_id(1), "First Name": "Ana"}))],
    );
    let store = MemoryStore::new();
    store.create_table("contacts", &[("id", "text"), ("First Name", "text")]);
    let pipeline = pipeline(source, store);

    pipeline.run_incremental_sync("contacts", 10).await.unwrap();

    // Recreate with normalized names; the cached raw decision must be dropped.
    pipeline
        .store()
        .create_table("contacts", &[("id", "text"), ("first_name", "text")]);
    pipeline.cursors().reset("contacts").await.unwrap();
    pipeline
        .schema_cache()
        .invalidate(pipeline.store(), "contacts");

    let report = pipeline.run_incremental_sync("contacts", 10).await.unwrap();
    assert_counts(&report, 1, 0, 0);
    let row = pipeline
        .store()
        .find_row("contacts", "id", &external_id(1))
        .unwrap();
    assert_eq!(row["first_name"], SqlValue::Text("Ana".into()));
}
