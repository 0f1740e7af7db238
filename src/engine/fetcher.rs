use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;
use crate::models::Renderer;

/// Retry schedule for transient network failures: base 2s, doubling, capped.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;
const BACKOFF_CAP_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Target URL did not respond in time")]
    Timeout,
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Browser rendering failed: {0}")]
    Browser(String),
    #[error("Browser rendering is not available")]
    BrowserUnavailable,
}

/// Result of one completed fetch, whichever renderer produced it.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub text: String,
    pub raw_bytes: Vec<u8>,
    pub final_url: String,
    pub duration_ms: i64,
    pub renderer: Renderer,
}

impl FetchResult {
    pub fn content_type(&self) -> String {
        self.headers
            .get("content-type")
            .cloned()
            .unwrap_or_default()
            .to_lowercase()
    }
}

/// HTTP fetcher with browser-like headers, bounded retries, and optional
/// proxy support. Non-2xx statuses are returned to the caller as-is; only
/// transport-level failures retry.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    read_timeout_ms: u64,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher").finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: &Config) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert("DNT", HeaderValue::from_static("1"));
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        let mut builder = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .connect_timeout(Duration::from_millis(config.fetch_connect_timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(10))
            .gzip(true)
            .brotli(true)
            .pool_max_idle_per_host(20);

        if config.proxy_enabled {
            if let Some(proxy_url) = &config.proxy_url {
                match reqwest::Proxy::all(proxy_url) {
                    Ok(proxy) => builder = builder.proxy(proxy),
                    Err(e) => {
                        tracing::warn!(error = %e, "Invalid proxy URL, continuing without proxy")
                    }
                }
            }
        }

        let client = builder.build().expect("Failed to build HTTP client");

        HttpFetcher {
            client,
            read_timeout_ms: config.fetch_read_timeout_ms,
        }
    }

    /// Fetch a URL, retrying timeouts and connect failures with exponential
    /// backoff. Records the final URL after redirects.
    pub async fn fetch(&self, url: &str, timeout_ms: u64) -> Result<FetchResult, FetchError> {
        let per_request = Duration::from_millis(self.read_timeout_ms.min(timeout_ms));

        let mut attempt: u32 = 0;
        loop {
            let start = Instant::now();
            let result = self.client.get(url).timeout(per_request).send().await;

            match result {
                Ok(response) => {
                    let status_code = response.status().as_u16();
                    let final_url = response.url().to_string();

                    let mut headers = HashMap::new();
                    for (name, value) in response.headers() {
                        if let Ok(v) = value.to_str() {
                            headers.insert(name.as_str().to_lowercase(), v.to_string());
                        }
                    }

                    let raw_bytes = match response.bytes().await {
                        Ok(b) => b.to_vec(),
                        Err(e) => {
                            if let Some(err) = self.retry_or_give_up(&e, &mut attempt).await? {
                                return Err(err);
                            }
                            continue;
                        }
                    };
                    let text = String::from_utf8_lossy(&raw_bytes).into_owned();

                    return Ok(FetchResult {
                        status_code,
                        headers,
                        text,
                        raw_bytes,
                        final_url,
                        duration_ms: start.elapsed().as_millis() as i64,
                        renderer: Renderer::Http,
                    });
                }
                Err(e) => {
                    if let Some(err) = self.retry_or_give_up(&e, &mut attempt).await? {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Returns Ok(None) after sleeping when another attempt should be made,
    /// Ok(Some(err)) when the error is terminal.
    async fn retry_or_give_up(
        &self,
        e: &reqwest::Error,
        attempt: &mut u32,
    ) -> Result<Option<FetchError>, FetchError> {
        let retriable = e.is_timeout() || e.is_connect();
        if !retriable || *attempt + 1 >= MAX_ATTEMPTS {
            if e.is_timeout() {
                return Ok(Some(FetchError::Timeout));
            }
            return Ok(Some(FetchError::Request(e.to_string())));
        }

        let backoff = (BACKOFF_BASE_SECS << *attempt).min(BACKOFF_CAP_SECS);
        tracing::debug!(
            attempt = *attempt + 1,
            backoff_secs = backoff,
            error = %e,
            "Fetch failed, retrying"
        );
        tokio::time::sleep(Duration::from_secs(backoff)).await;
        *attempt += 1;
        Ok(None)
    }
}
