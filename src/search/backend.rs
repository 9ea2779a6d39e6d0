//! Web search backends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{Result, UalError};

pub const DEFAULT_MAX_RESULTS: usize = 8;
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A hit as the backend returned it, before ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub full_text: Option<String>,
    pub published_date: Option<String>,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<RawHit>>;
}

/// SearxNG-compatible JSON API: `GET {endpoint}?q=..&format=json`.
pub struct SearxBackend {
    client: Client,
    endpoint: String,
    max_results: usize,
    timeout: Duration,
}

#[derive(Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxHit>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearxHit {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    published_date: Option<String>,
}

impl SearxBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            max_results: DEFAULT_MAX_RESULTS,
            timeout: DEFAULT_SEARCH_TIMEOUT,
        }
    }

    /// Requests slower than this fail, which the search machine treats as an outage.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }
}

#[async_trait]
impl SearchBackend for SearxBackend {
    async fn search(&self, query: &str) -> Result<Vec<RawHit>> {
        let url = Url::parse_with_params(&self.endpoint, &[("q", query), ("format", "json")])
            .map_err(|e| UalError::Search(format!("bad search endpoint: {}", e)))?;

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| UalError::Search(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UalError::Search(format!("search backend returned {}", status)));
        }
        let body: SearxResponse = response
            .json()
            .await
            .map_err(|e| UalError::Search(format!("invalid search response: {}", e)))?;

        debug!(query, hits = body.results.len(), "search backend answered");
        Ok(body
            .results
            .into_iter()
            .take(self.max_results)
            .map(|hit| RawHit {
                title: hit.title,
                url: hit.url,
                snippet: hit.content,
                full_text: None,
                published_date: hit.published_date,
            })
            .collect())
    }
}

/// Used when no search endpoint is configured.
pub struct OfflineBackend;

#[async_trait]
impl SearchBackend for OfflineBackend {
    async fn search(&self, _query: &str) -> Result<Vec<RawHit>> {
        Err(UalError::Search("no search backend configured".to_string()))
    }
}

/// Stand-in hit used when the backend is unavailable.
pub fn synthetic_hit(query: &str, reason: &str) -> RawHit {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    RawHit {
        title: format!("Search for \"{}\"", query),
        url: format!("https://duckduckgo.com/?q={}", encoded),
        snippet: format!(
            "Live results for \"{}\" are unavailable right now ({}). Open the link to search directly.",
            query, reason
        ),
        full_text: None,
        published_date: None,
    }
}

/// Host without a leading `www.`, or the raw string when it is not a URL.
pub fn source_domain(raw: &str) -> String {
    Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_searx_backend_parses_hits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust async"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"title": "Async Book", "url": "https://rust-lang.github.io/async-book/", "content": "Async in Rust", "publishedDate": "2024-01-01"},
                    {"title": "Tokio", "url": "https://tokio.rs", "content": "Runtime"},
                    {"title": "Extra", "url": "https://example.com", "content": "x"}
                ]
            })))
            .mount(&server)
            .await;

        let backend = SearxBackend::new(format!("{}/search", server.uri())).with_max_results(2);
        let hits = backend.search("rust async").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].snippet, "Async in Rust");
        assert_eq!(hits[0].published_date.as_deref(), Some("2024-01-01"));
        assert_eq!(hits[1].url, "https://tokio.rs");
    }

    #[tokio::test]
    async fn test_searx_backend_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let err = SearxBackend::new(server.uri()).search("x").await.unwrap_err();
        assert!(matches!(err, UalError::Search(_)));
    }

    #[test]
    fn test_synthetic_hit_and_domain() {
        let hit = synthetic_hit("rust & go", "timeout");
        assert_eq!(hit.url, "https://duckduckgo.com/?q=rust+%26+go");
        assert!(hit.snippet.contains("timeout"));
        assert_eq!(source_domain("https://www.rust-lang.org/learn"), "rust-lang.org");
        assert_eq!(source_domain("not a url"), "not a url");
    }
}
