use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("No search provider is configured")]
    NotConfigured,
    #[error("Search request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub rank: u32,
    pub title: String,
    pub url: String,
    pub snippet: Option<String>,
}

/// Web search adapter: query in, ranked results out.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, num_results: u32) -> Result<Vec<SearchHit>, SearchError>;
}

/// Pick a provider by which API key is configured: Serper first, SerpApi as
/// the alternative.
pub fn from_config(config: &Config) -> Option<Arc<dyn SearchProvider>> {
    let timeout = Duration::from_millis(config.search_timeout_ms);
    let http = reqwest::Client::builder().timeout(timeout).build().ok()?;

    if let Some(key) = &config.serper_api_key {
        return Some(Arc::new(SerperProvider {
            http,
            api_key: key.clone(),
        }));
    }
    if let Some(key) = &config.serpapi_api_key {
        return Some(Arc::new(SerpApiProvider {
            http,
            api_key: key.clone(),
        }));
    }
    None
}

async fn with_retries<F, Fut>(mut call: F) -> Result<Value, SearchError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(resp) if resp.status().is_success() => {
                return resp
                    .json::<Value>()
                    .await
                    .map_err(|e| SearchError::Request(e.to_string()));
            }
            Ok(resp) => {
                return Err(SearchError::Request(format!(
                    "status {}",
                    resp.status().as_u16()
                )));
            }
            Err(e) if (e.is_timeout() || e.is_connect()) && attempt + 1 < MAX_ATTEMPTS => {
                let backoff = (2u64 << attempt).min(10);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                attempt += 1;
            }
            Err(e) => return Err(SearchError::Request(e.to_string())),
        }
    }
}

fn hits_from_organic(organic: &[Value], num_results: u32) -> Vec<SearchHit> {
    organic
        .iter()
        .take(num_results as usize)
        .enumerate()
        .map(|(idx, item)| SearchHit {
            rank: idx as u32 + 1,
            title: item
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            url: item
                .get("link")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            snippet: item
                .get("snippet")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
        .collect()
}

pub struct SerperProvider {
    http: reqwest::Client,
    api_key: String,
}

#[async_trait]
impl SearchProvider for SerperProvider {
    async fn search(&self, query: &str, num_results: u32) -> Result<Vec<SearchHit>, SearchError> {
        let body = serde_json::json!({ "q": query, "num": num_results });
        let data = with_retries(|| {
            self.http
                .post("https://google.serper.dev/search")
                .header("X-API-KEY", &self.api_key)
                .json(&body)
                .send()
        })
        .await?;

        let organic = data
            .get("organic")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(hits_from_organic(&organic, num_results))
    }
}

pub struct SerpApiProvider {
    http: reqwest::Client,
    api_key: String,
}

#[async_trait]
impl SearchProvider for SerpApiProvider {
    async fn search(&self, query: &str, num_results: u32) -> Result<Vec<SearchHit>, SearchError> {
        let data = with_retries(|| {
            self.http
                .get("https://serpapi.com/search")
                .query(&[
                    ("api_key", self.api_key.as_str()),
                    ("q", query),
                    ("num", &num_results.to_string()),
                    ("engine", "google"),
                ])
                .send()
        })
        .await?;

        let organic = data
            .get("organic_results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(hits_from_organic(&organic, num_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_from_organic_ranks_and_truncates() {
        let organic: Vec<Value> = (0..5)
            .map(|i| {
                serde_json::json!({
                    "title": format!("Title {i}"),
                    "link": format!("https://example.com/{i}"),
                    "snippet": format!("Snippet {i}"),
                })
            })
            .collect();

        let hits = hits_from_organic(&organic, 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].rank, 1);
        assert_eq!(hits[2].rank, 3);
        assert_eq!(hits[1].url, "https://example.com/1");
        assert_eq!(hits[0].snippet.as_deref(), Some("Snippet 0"));
    }

    #[test]
    fn test_hits_tolerate_missing_fields() {
        let organic = vec![serde_json::json!({"link": "https://example.com"})];
        let hits = hits_from_organic(&organic, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "");
        assert!(hits[0].snippet.is_none());
    }

    #[test]
    fn test_from_config_without_keys() {
        assert!(from_config(&Config::for_tests()).is_none());
    }

    #[test]
    fn test_from_config_prefers_serper() {
        let mut config = Config::for_tests();
        config.serper_api_key = Some("k1".to_string());
        config.serpapi_api_key = Some("k2".to_string());
        assert!(from_config(&config).is_some());
    }
}
