// ABOUTME: PostgreSQL connection management for the destination database
// ABOUTME: Re-exports connect helpers used by the CLI and integration tests

pub mod connection;

pub use connection::{connect, connect_with_retry};
