// ABOUTME: HTTP client for the source records API
// ABOUTME: Bearer-authenticated GET of offset/limit pages with retry on failure

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

use super::{Page, SourceClient};
use crate::utils::retry_with_backoff;

const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct HttpSourceClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpSourceClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("Invalid source API URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Source API URL '{}' cannot be used as a base URL", base_url);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// `{base}/tables/{table}/records`
    fn records_url(&self, table: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("Source API URL cannot be a base"))?
            .pop_if_empty()
            .extend(["tables", table, "records"]);
        Ok(url)
    }

    async fn fetch_once(&self, url: &Url, cursor: u64, limit: usize) -> Result<Page> {
        let mut request = self
            .client
            .get(url.clone())
            .query(&[("offset", cursor.to_string()), ("limit", limit.to_string())]);

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach source API at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                bail!(
                    "Source API rejected the credentials ({}). Check SOURCE_API_KEY or [source].api_key",
                    status
                );
            }

            bail!("Source API returned {}: {}", status, body);
        }

        response
            .json::<Page>()
            .await
            .context("Failed to parse source API page")
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch_page(&self, table: &str, cursor: u64, limit: usize) -> Result<Page> {
        let url = self.records_url(table)?;
        tracing::debug!("GET {} offset={} limit={}", url, cursor, limit);

        retry_with_backoff(
            || self.fetch_once(&url, cursor, limit),
            MAX_RETRIES,
            INITIAL_RETRY_DELAY,
        )
        .await
        .with_context(|| format!("Failed to fetch '{}' at cursor {}", table, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = HttpSourceClient::new("https://api.example.com", None, Duration::from_secs(5));
        assert!(client.is_ok());
    }

    #[test]
    fn test_client_rejects_invalid_url() {
        assert!(HttpSourceClient::new("not a url", None, Duration::from_secs(5)).is_err());
        assert!(HttpSourceClient::new("mailto:ops@example.com", None, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_records_url() {
        let client =
            HttpSourceClient::new("https://api.example.com/v1/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            client.records_url("invoice_item").unwrap().as_str(),
            "https://api.example.com/v1/tables/invoice_item/records"
        );
    }
}
