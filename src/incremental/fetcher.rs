// ABOUTME: Pages through the source API from a cursor until a record limit is met
// ABOUTME: Caps each request at the source's batch size and pauses between batches

use anyhow::{Context, Result};
use std::time::Duration;

use crate::source::{SourceClient, SourceRecord};

/// Default maximum records the source returns per request.
pub const DEFAULT_MAX_BATCH: usize = 100;
/// Default pause between consecutive requests.
pub const DEFAULT_INTER_BATCH_DELAY: Duration = Duration::from_millis(250);

/// Records retrieved by one fetch and the cursor just past the last one.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub records: Vec<SourceRecord>,
    pub final_cursor: u64,
}

pub struct PaginatedFetcher<'a, C: ?Sized> {
    source: &'a C,
    max_batch: usize,
    inter_batch_delay: Duration,
}

impl<'a, C> PaginatedFetcher<'a, C>
where
    C: SourceClient + ?Sized,
{
    pub fn new(source: &'a C) -> Self {
        Self {
            source,
            max_batch: DEFAULT_MAX_BATCH,
            inter_batch_delay: DEFAULT_INTER_BATCH_DELAY,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    /// Fetch up to `limit` records of `table` starting at `start`.
    ///
    /// Stops early when a batch comes back short or the source reports
    /// nothing remaining. Any failed batch fails the whole fetch; records
    /// gathered before it are discarded.
    pub async fn fetch(&self, table: &str, start: u64, limit: usize) -> Result<FetchResult> {
        let mut records = Vec::new();
        let mut cursor = start;
        let mut remaining = limit;
        let mut batches = 0usize;

        while remaining > 0 {
            if batches > 0 && !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }

            let requested = remaining.min(self.max_batch);
            let page = self
                .source
                .fetch_page(table, cursor, requested)
                .await
                .with_context(|| {
                    format!(
                        "Fetch of '{}' failed at cursor {} after {} batch(es)",
                        table, cursor, batches
                    )
                })?;
            batches += 1;

            let received = page.records.len().min(requested);
            tracing::debug!(
                "Batch {} of '{}': requested {} at cursor {}, received {}",
                batches,
                table,
                requested,
                cursor,
                received
            );

            records.extend(page.records.into_iter().take(requested));
            cursor += received as u64;
            remaining -= received;

            if received < requested || page.remaining == Some(0) {
                break;
            }
        }

        Ok(FetchResult {
            records,
            final_cursor: cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use serde_json::json;

    fn source_with(n: usize, page_size: usize) -> MemorySource {
        let source = MemorySource::new(page_size);
        source.set_records(
            "invoice_item",
            (0..n)
                .map(|i| serde_json::from_value(json!({"id": i.to_string()})).unwrap())
                .collect(),
        );
        source
    }

    #[tokio::test]
    async fn test_fetch_loops_over_batches() {
        let source = source_with(1000, 100);
        let fetcher = PaginatedFetcher::new(&source).with_inter_batch_delay(Duration::ZERO);

        let result = fetcher.fetch("invoice_item", 0, 250).await.unwrap();
        assert_eq!(result.records.len(), 250);
        assert_eq!(result.final_cursor, 250);

        let limits: Vec<usize> = source.requests().iter().map(|r| r.2).collect();
        assert_eq!(limits, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn test_fetch_stops_when_exhausted() {
        let source = source_with(3905, 100);
        let fetcher = PaginatedFetcher::new(&source).with_inter_batch_delay(Duration::ZERO);

        let result = fetcher.fetch("invoice_item", 3900, 50).await.unwrap();
        assert_eq!(result.records.len(), 5);
        assert_eq!(result.final_cursor, 3905);
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_discards_partial() {
        let source = source_with(500, 100);
        source.fail_from(Some(200));
        let fetcher = PaginatedFetcher::new(&source).with_inter_batch_delay(Duration::ZERO);

        let err = fetcher.fetch("invoice_item", 0, 400).await.unwrap_err();
        assert!(format!("{:#}", err).contains("cursor 200"));
    }

    #[tokio::test]
    async fn test_fetch_with_unbounded_batch_size() {
        let source = source_with(50, 100);
        let fetcher = PaginatedFetcher::new(&source)
            .with_max_batch(usize::MAX)
            .with_inter_batch_delay(Duration::ZERO);

        let result = fetcher.fetch("invoice_item", 0, 10).await.unwrap();
        assert_eq!(result.records.len(), 10);

        let all = fetcher.fetch("invoice_item", 0, usize::MAX).await.unwrap();
        assert_eq!(all.records.len(), 50);
        assert_eq!(all.final_cursor, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_pauses_between_batches() {
        let source = source_with(300, 100);
        let fetcher =
            PaginatedFetcher::new(&source).with_inter_batch_delay(Duration::from_millis(250));

        let started = tokio::time::Instant::now();
        fetcher.fetch("invoice_item", 0, 300).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }
}
