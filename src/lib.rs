// ABOUTME: Library entry point for api-replicator
// ABOUTME: Incremental replication of paginated API tables into PostgreSQL

pub mod commands;
pub mod config;
pub mod incremental;
pub mod postgres;
pub mod source;
pub mod store;
pub mod utils;

pub use config::ReplicatorConfig;
pub use incremental::{SyncMode, SyncOrchestrator, SyncReport};
