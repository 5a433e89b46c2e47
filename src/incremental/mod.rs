// ABOUTME: Incremental synchronization core for cursor-paginated source tables
// ABOUTME: Cursor tracking, schema-adaptive mapping, upserts and schema-drift patches

pub mod cursor;
pub mod fetcher;
pub mod mapper;
pub mod orchestrator;
pub mod patch;
pub mod relationship;
pub mod schema_type;
pub mod upsert;

pub use cursor::CursorStore;
pub use fetcher::{FetchResult, PaginatedFetcher};
pub use mapper::FieldMapper;
pub use orchestrator::{SyncOptions, SyncOrchestrator, SyncPhase, SyncReport};
pub use patch::{PatchContext, SchemaError, SchemaPatchCommand, SchemaPatchWorkflow};
pub use relationship::RelationshipClassifier;
pub use schema_type::{Convention, SchemaTypeCache};
pub use upsert::{SyncMode, UpsertAction, UpsertEngine, UpsertError};
