// ABOUTME: Source API collaborator contract for paginated record retrieval
// ABOUTME: Pages of JSON records addressed by an integer offset cursor

pub mod http;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use http::HttpSourceClient;
pub use memory::MemorySource;

/// One record as returned by the source API.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceRecord(Map<String, Value>);

impl SourceRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The record's stable identifier, read from `id_field`.
    ///
    /// Numeric identifiers are rendered as strings; anything else counts as missing.
    pub fn external_id(&self, id_field: &str) -> Option<String> {
        match self.0.get(id_field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for SourceRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// One page of records starting at the requested cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<SourceRecord>,
    /// Records left in the table after this page, when the source reports it
    #[serde(default)]
    pub remaining: Option<u64>,
}

/// Retrieves pages of records from the source system.
///
/// Implementations own authentication, transport retries and wire-level rate
/// limiting. A page may hold fewer records than `limit`; a short page means
/// the table is exhausted.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn fetch_page(&self, table: &str, cursor: u64, limit: usize) -> Result<Page>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> SourceRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_external_id() {
        let r = record(json!({"id": "1700000000000_123456789012345", "name": "x"}));
        assert_eq!(
            r.external_id("id").as_deref(),
            Some("1700000000000_123456789012345")
        );
        assert_eq!(record(json!({"id": 42})).external_id("id").as_deref(), Some("42"));
        assert!(record(json!({"id": ""})).external_id("id").is_none());
        assert!(record(json!({"name": "x"})).external_id("id").is_none());
    }

    #[test]
    fn test_page_without_remaining() {
        let page: Page = serde_json::from_value(json!({"records": [{"id": "a"}]})).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.remaining, None);
    }
}
