// ABOUTME: In-process source holding records per table
// ABOUTME: Serves offset pages with a page-size cap and optional injected failures

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Page, SourceClient, SourceRecord};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, Vec<SourceRecord>>,
    fail_at: Option<u64>,
    requests: Vec<(String, u64, usize)>,
}

/// Source serving records from memory, capped at `max_page_size` per page.
#[derive(Debug)]
pub struct MemorySource {
    inner: Mutex<Inner>,
    max_page_size: usize,
}

impl MemorySource {
    pub fn new(max_page_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_page_size: max_page_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the records served for `table`.
    pub fn set_records(&self, table: &str, records: Vec<SourceRecord>) {
        self.lock().tables.insert(table.to_string(), records);
    }

    /// Append records to `table`.
    pub fn push_records(&self, table: &str, records: Vec<SourceRecord>) {
        self.lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(records);
    }

    /// Fail any page request at or beyond `cursor`.
    pub fn fail_from(&self, cursor: Option<u64>) {
        self.lock().fail_at = cursor;
    }

    /// Page requests received so far as (table, cursor, limit).
    pub fn requests(&self) -> Vec<(String, u64, usize)> {
        self.lock().requests.clone()
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn fetch_page(&self, table: &str, cursor: u64, limit: usize) -> Result<Page> {
        let mut inner = self.lock();
        inner.requests.push((table.to_string(), cursor, limit));

        if let Some(fail_at) = inner.fail_at {
            if cursor >= fail_at {
                bail!("source unavailable at cursor {}", cursor);
            }
        }

        let records = inner.tables.get(table).map(Vec::as_slice).unwrap_or(&[]);
        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(records.len());
        let take = limit.min(self.max_page_size);
        let end = start.saturating_add(take).min(records.len());

        Ok(Page {
            records: records[start..end].to_vec(),
            remaining: Some((records.len() - end) as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(n: usize) -> Vec<SourceRecord> {
        (0..n)
            .map(|i| serde_json::from_value(json!({"id": i.to_string()})).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_page_is_capped() {
        let source = MemorySource::new(100);
        source.set_records("t", records(250));

        let page = source.fetch_page("t", 0, 500).await.unwrap();
        assert_eq!(page.records.len(), 100);
        assert_eq!(page.remaining, Some(150));

        let tail = source.fetch_page("t", 200, 100).await.unwrap();
        assert_eq!(tail.records.len(), 50);
        assert_eq!(tail.remaining, Some(0));
    }

    #[tokio::test]
    async fn test_unknown_table_is_empty() {
        let source = MemorySource::new(10);
        let page = source.fetch_page("missing", 0, 10).await.unwrap();
        assert!(page.records.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let source = MemorySource::new(10);
        source.set_records("t", records(30));
        source.fail_from(Some(10));

        assert!(source.fetch_page("t", 0, 10).await.is_ok());
        assert!(source.fetch_page("t", 10, 10).await.is_err());
    }
}
