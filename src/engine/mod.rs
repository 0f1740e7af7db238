pub mod browser;
pub mod cache;
pub mod crawler;
pub mod extractor;
pub mod fetcher;
pub mod render;
pub mod robots;
pub mod throttle;
pub mod urls;

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use url::Url;

use crate::config::Config;
use crate::error::{ApiError, ErrorCode};
use crate::llm::{GeminiClient, StructuredExtractor};
use crate::metrics::Metrics;
use crate::models::{
    CacheLayer, Links, PageMetadata, Renderer, ScrapeRequest, ScrapeResponse,
};
use crate::search::SearchProvider;
use crate::storage::{NewPage, PageRow, Store};

use browser::BrowserPool;
use cache::{Kv, SingleFlight};
use fetcher::{FetchError, FetchResult, HttpFetcher};
use robots::RobotsOracle;
use throttle::DomainThrottle;

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Redis connection failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Process-wide engine state: every shared resource the pipeline touches
/// lives here and is handed to handlers and workers by `Arc`.
pub struct Engine {
    pub config: Arc<Config>,
    pub store: Store,
    pub kv: Kv,
    pub metrics: Metrics,
    pub fetcher: HttpFetcher,
    pub browser: Option<BrowserPool>,
    pub robots: RobotsOracle,
    pub throttle: DomainThrottle,
    pub flights: SingleFlight,
    pub llm: Option<Arc<dyn StructuredExtractor>>,
    pub search: Option<Arc<dyn SearchProvider>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub async fn init(config: Arc<Config>) -> Result<Self, InitError> {
        let store = Store::connect(&config.database_url)?;
        let kv = Kv::open(&config.redis_url)?;
        let metrics = Metrics::new();
        let fetcher = HttpFetcher::new(&config);

        let browser = if config.browser_enabled {
            match BrowserPool::launch(&config).await {
                Ok(pool) => Some(pool),
                Err(e) => {
                    tracing::warn!(error = %e, "Browser pool unavailable, continuing without rendering");
                    None
                }
            }
        } else {
            None
        };

        let robots = RobotsOracle::new(&config.robots_user_agent);
        let throttle = DomainThrottle::new(config.max_domain_concurrency);

        let llm = GeminiClient::from_config(&config)
            .map(|c| Arc::new(c) as Arc<dyn StructuredExtractor>);
        let search = crate::search::from_config(&config);

        Ok(Engine {
            config,
            store,
            kv,
            metrics,
            fetcher,
            browser,
            robots,
            throttle,
            flights: SingleFlight::default(),
            llm,
            search,
        })
    }

    /// Engine suitable for API-surface tests: lazy stores, no browser.
    pub fn for_tests(config: Arc<Config>) -> Result<Self, InitError> {
        let store = Store::connect(&config.database_url)?;
        let kv = Kv::open(&config.redis_url)?;
        let fetcher = HttpFetcher::new(&config);
        let robots = RobotsOracle::new(&config.robots_user_agent);
        let throttle = DomainThrottle::new(config.max_domain_concurrency);

        Ok(Engine {
            config,
            store,
            kv,
            metrics: Metrics::new(),
            fetcher,
            browser: None,
            robots,
            throttle,
            flights: SingleFlight::default(),
            llm: None,
            search: None,
        })
    }

    pub async fn shutdown(&self) {
        if let Some(pool) = &self.browser {
            pool.shutdown().await;
        }
        tracing::info!("Engine shut down");
    }

    /// Routed fetch without host throttling; crawl and scrape paths hold the
    /// domain permit themselves so it spans robots + fetch + render.
    pub async fn fetch_routed(
        &self,
        url: &str,
        mode: crate::models::RenderMode,
        timeout_ms: u64,
    ) -> Result<FetchResult, FetchError> {
        render::fetch_routed(
            &self.fetcher,
            self.browser.as_ref(),
            &self.metrics,
            url,
            mode,
            timeout_ms,
        )
        .await
    }

    /// The single-URL pipeline: guard, robots, cache tiers, singleflight,
    /// throttled fetch, extraction, durable + hot write-through.
    pub async fn scrape(&self, req: &ScrapeRequest) -> Result<ScrapeResponse, ApiError> {
        let normalized = urls::normalize(&req.url, None)
            .ok_or_else(|| ApiError::validation("URL must contain a valid hostname"))?;

        // Guard the canonical form: normalization rewrites the host (www.
        // strip), and the checked name must be the fetched name.
        if let Err(e) = urls::validate_ssrf(&normalized).await {
            if e.code == ErrorCode::SsrfBlocked {
                self.metrics.ssrf_blocked_total.inc();
            }
            return Err(e);
        }

        if req.respect_robots && !self.robots.is_allowed(&normalized).await {
            self.metrics.robots_blocked_total.inc();
            return Err(ApiError::new(
                ErrorCode::RobotsBlocked,
                "robots.txt disallows this URL",
            )
            .with_details(json!({ "url": normalized })));
        }

        let url_hash = urls::url_hash(&normalized);
        let ttl = req
            .cache_ttl_seconds
            .unwrap_or(self.config.cache_ttl_seconds);
        let read_cache = !req.force_refresh && ttl > 0;

        if read_cache {
            if let Some(hit) = self.cache_lookup(&url_hash, ttl, req).await? {
                return Ok(hit);
            }
        }

        // One in-flight fetch per url_hash; a loser wakes to the winner's
        // freshly written hot entry.
        let _flight = self.flights.acquire(&url_hash).await;
        if read_cache {
            if let Some(mut hit) = cache::hot_get(&self.kv, &url_hash).await {
                self.metrics.cache_hits_total.inc();
                hit.cached = true;
                hit.cache_layer = CacheLayer::Redis;
                trim_to_request(&mut hit, req);
                return Ok(hit);
            }
        }

        let existing = self.store.page_by_url_hash(&url_hash).await?;

        let host = Url::parse(&normalized)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();

        let fetched = {
            let _permit = self
                .throttle
                .acquire(
                    &host,
                    self.config.max_domain_concurrency,
                    self.config.domain_delay_ms,
                )
                .await;

            match self
                .fetch_routed(&normalized, req.use_playwright, req.timeout_ms)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    let api = fetch_error_to_api(&e, req.timeout_ms);
                    let error_row = NewPage::error(
                        &normalized,
                        &url_hash,
                        api.code.as_str(),
                        &api.message,
                    );
                    if let Err(db) = self.store.upsert_page(&error_row).await {
                        tracing::warn!(error = %db, url = %normalized, "Failed to record fetch error");
                    }
                    return Err(api);
                }
            }
        };

        let (new_page, response) =
            self.assemble(&normalized, &url_hash, req, existing.as_ref(), &fetched);

        let stored = self.store.upsert_page(&new_page).await?;
        tracing::debug!(url = %stored.url, renderer = ?fetched.renderer, "Page stored");

        if ttl > 0 {
            cache::hot_put(&self.kv, &url_hash, &response).await;
        }

        Ok(response)
    }

    /// Hot tier, then the durable Page row (backfilling hot on a durable
    /// hit). Fresh error rows surface as errors rather than replaying as
    /// success.
    async fn cache_lookup(
        &self,
        url_hash: &str,
        ttl: u64,
        req: &ScrapeRequest,
    ) -> Result<Option<ScrapeResponse>, ApiError> {
        if let Some(mut hit) = cache::hot_get(&self.kv, url_hash).await {
            self.metrics.cache_hits_total.inc();
            hit.cached = true;
            hit.cache_layer = CacheLayer::Redis;
            trim_to_request(&mut hit, req);
            return Ok(Some(hit));
        }

        let page = match self.store.page_by_url_hash(url_hash).await? {
            Some(p) => p,
            None => return Ok(None),
        };

        let age = Utc::now()
            .signed_duration_since(page.fetched_at)
            .num_seconds();
        if age < 0 || age as u64 > ttl {
            return Ok(None);
        }

        if let Some(code) = &page.error_code {
            self.metrics.cache_hits_total.inc();
            return Err(ApiError::new(
                ErrorCode::FetchError,
                page.error_message
                    .clone()
                    .unwrap_or_else(|| "Cached fetch error".to_string()),
            )
            .with_details(json!({ "cached": true, "upstream_code": code })));
        }

        if page.markdown.as_deref().is_none_or(str::is_empty) {
            return Ok(None);
        }

        self.metrics.cache_hits_total.inc();
        // Backfill hot with the full shape; trim only the returned copy.
        let mut response = response_from_page(&page, true, CacheLayer::Db);
        cache::hot_put(&self.kv, url_hash, &response).await;
        trim_to_request(&mut response, req);
        Ok(Some(response))
    }

    /// Turn a fetch result into the page row and response, taking the
    /// content-hash short-circuit when the body is unchanged.
    fn assemble(
        &self,
        normalized: &str,
        url_hash: &str,
        req: &ScrapeRequest,
        existing: Option<&PageRow>,
        fetched: &FetchResult,
    ) -> (NewPage, ScrapeResponse) {
        let content_hash = urls::sha256_hex_bytes(&fetched.raw_bytes);
        let canonical_fallback = urls::normalize(&fetched.final_url, None)
            .unwrap_or_else(|| normalized.to_string());

        let is_pdf = fetched.content_type().contains("application/pdf")
            || normalized
                .split('?')
                .next()
                .unwrap_or_default()
                .to_lowercase()
                .ends_with(".pdf");

        if is_pdf {
            return self.assemble_pdf(
                normalized,
                url_hash,
                fetched,
                &content_hash,
                &canonical_fallback,
            );
        }

        // Same bytes as last time: reuse the stored extraction wholesale.
        if let Some(prev) = existing {
            if prev.content_hash.as_deref() == Some(content_hash.as_str()) {
                self.metrics.hash_hits_total.inc();
                return self.assemble_hash_hit(
                    normalized,
                    url_hash,
                    req,
                    prev,
                    fetched,
                    &content_hash,
                    &canonical_fallback,
                );
            }
        }

        let raw_html = &fetched.text;
        let meta = extractor::extract_metadata(raw_html, normalized);
        let links = if req.include_links {
            Some(extractor::extract_links(
                raw_html,
                if fetched.final_url.is_empty() {
                    normalized
                } else {
                    &fetched.final_url
                },
            ))
        } else {
            None
        };

        let cleaned = extractor::clean_html(raw_html);
        let content = extractor::extract_content(&cleaned);
        let mut markdown = extractor::html_to_markdown(&content.main_html);
        if !content.tables.is_empty() {
            let tables = content.tables.join("\n\n");
            if markdown.is_empty() {
                markdown = tables;
            } else {
                markdown = format!("{markdown}\n\n{tables}");
            }
        }

        let words = extractor::word_count(&markdown);
        let read_time = extractor::read_time_minutes(words);
        let canonical = meta
            .canonical_url
            .clone()
            .and_then(|c| urls::normalize(&c, None))
            .unwrap_or(canonical_fallback);

        let new_page = NewPage {
            url: normalized.to_string(),
            canonical_url: Some(canonical.clone()),
            url_hash: url_hash.to_string(),
            content_hash: Some(content_hash),
            status_code: Some(fetched.status_code as i32),
            title: meta.title.clone(),
            description: meta.description.clone(),
            markdown: Some(markdown.clone()),
            raw_html: req.include_raw_html.then(|| raw_html.clone()),
            renderer: Some(fetched.renderer.as_str().to_string()),
            links_internal: links.as_ref().map(|l| l.internal.clone()),
            links_external: links.as_ref().map(|l| l.external.clone()),
            word_count: Some(words as i32),
            read_time_minutes: Some(read_time as i32),
            fetch_duration_ms: Some(fetched.duration_ms),
            og_image: meta.og_image.clone(),
            favicon_url: meta.favicon_url.clone(),
            site_name: meta.site_name.clone(),
            language: meta.language.clone(),
            error_code: None,
            error_message: None,
        };

        let response = ScrapeResponse {
            url: normalized.to_string(),
            canonical_url: canonical,
            status_code: fetched.status_code,
            title: meta.title,
            markdown,
            metadata: PageMetadata {
                description: meta.description,
                og_image: meta.og_image,
                author: meta.author,
                published_at: meta.published_at,
                site_name: meta.site_name,
                language: meta.language,
                favicon_url: meta.favicon_url,
                word_count: Some(words as i32),
                read_time_minutes: Some(read_time as i32),
                fetch_duration_ms: fetched.duration_ms,
                renderer: fetched.renderer.as_str().to_string(),
            },
            links: links.map(|l| Links {
                internal: l.internal,
                external: l.external,
            }),
            raw_html: req.include_raw_html.then(|| fetched.text.clone()),
            cached: false,
            cache_layer: CacheLayer::None,
            request_id: String::new(),
        };

        (new_page, response)
    }

    fn assemble_pdf(
        &self,
        normalized: &str,
        url_hash: &str,
        fetched: &FetchResult,
        content_hash: &str,
        canonical: &str,
    ) -> (NewPage, ScrapeResponse) {
        let (markdown, pdf_meta) = match extractor::extract_pdf(&fetched.raw_bytes) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(url = %normalized, error = %e, "PDF extraction failed");
                (String::new(), extractor::PdfMeta::default())
            }
        };
        let words = extractor::word_count(&markdown);
        let read_time = extractor::read_time_minutes(words);

        let new_page = NewPage {
            url: normalized.to_string(),
            canonical_url: Some(canonical.to_string()),
            url_hash: url_hash.to_string(),
            content_hash: Some(content_hash.to_string()),
            status_code: Some(fetched.status_code as i32),
            title: pdf_meta.title.clone(),
            markdown: Some(markdown.clone()),
            renderer: Some(fetched.renderer.as_str().to_string()),
            word_count: Some(words as i32),
            read_time_minutes: Some(read_time as i32),
            fetch_duration_ms: Some(fetched.duration_ms),
            ..NewPage::default()
        };

        let response = ScrapeResponse {
            url: normalized.to_string(),
            canonical_url: canonical.to_string(),
            status_code: fetched.status_code,
            title: pdf_meta.title,
            markdown,
            metadata: PageMetadata {
                description: None,
                og_image: None,
                author: None,
                published_at: None,
                site_name: None,
                language: None,
                favicon_url: None,
                word_count: Some(words as i32),
                read_time_minutes: Some(read_time as i32),
                fetch_duration_ms: fetched.duration_ms,
                renderer: fetched.renderer.as_str().to_string(),
            },
            links: None,
            raw_html: None,
            cached: false,
            cache_layer: CacheLayer::None,
            request_id: String::new(),
        };

        (new_page, response)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble_hash_hit(
        &self,
        normalized: &str,
        url_hash: &str,
        req: &ScrapeRequest,
        prev: &PageRow,
        fetched: &FetchResult,
        content_hash: &str,
        canonical_fallback: &str,
    ) -> (NewPage, ScrapeResponse) {
        let canonical = prev
            .canonical_url
            .clone()
            .unwrap_or_else(|| canonical_fallback.to_string());

        let new_page = NewPage {
            url: normalized.to_string(),
            canonical_url: Some(canonical.clone()),
            url_hash: url_hash.to_string(),
            content_hash: Some(content_hash.to_string()),
            status_code: Some(fetched.status_code as i32),
            title: prev.title.clone(),
            description: prev.description.clone(),
            markdown: prev.markdown.clone(),
            raw_html: req.include_raw_html.then(|| fetched.text.clone()),
            renderer: Some(fetched.renderer.as_str().to_string()),
            links_internal: prev.links_internal.clone(),
            links_external: prev.links_external.clone(),
            word_count: prev.word_count,
            read_time_minutes: prev.read_time_minutes,
            fetch_duration_ms: Some(fetched.duration_ms),
            og_image: prev.og_image.clone(),
            favicon_url: prev.favicon_url.clone(),
            site_name: prev.site_name.clone(),
            language: prev.language.clone(),
            error_code: None,
            error_message: None,
        };

        let links = if req.include_links {
            Some(Links {
                internal: prev.links_internal.clone().unwrap_or_default(),
                external: prev.links_external.clone().unwrap_or_default(),
            })
        } else {
            None
        };

        let response = ScrapeResponse {
            url: normalized.to_string(),
            canonical_url: canonical,
            status_code: fetched.status_code,
            title: prev.title.clone(),
            markdown: prev.markdown.clone().unwrap_or_default(),
            metadata: PageMetadata {
                description: prev.description.clone(),
                og_image: prev.og_image.clone(),
                author: None,
                published_at: None,
                site_name: prev.site_name.clone(),
                language: prev.language.clone(),
                favicon_url: prev.favicon_url.clone(),
                word_count: prev.word_count,
                read_time_minutes: prev.read_time_minutes,
                fetch_duration_ms: fetched.duration_ms,
                renderer: fetched.renderer.as_str().to_string(),
            },
            links,
            raw_html: req.include_raw_html.then(|| fetched.text.clone()),
            cached: false,
            cache_layer: CacheLayer::None,
            request_id: String::new(),
        };

        (new_page, response)
    }
}

/// A cache hit may have been written for a differently shaped request; only
/// hand back the optional blocks this caller asked for.
fn trim_to_request(hit: &mut ScrapeResponse, req: &ScrapeRequest) {
    if !req.include_links {
        hit.links = None;
    }
    if !req.include_raw_html {
        hit.raw_html = None;
    }
}

/// Map a fetch failure onto the surfaced taxonomy.
pub fn fetch_error_to_api(err: &FetchError, timeout_ms: u64) -> ApiError {
    match err {
        FetchError::Timeout => ApiError::new(
            ErrorCode::FetchTimeout,
            format!("Target URL did not respond within {timeout_ms}ms"),
        )
        .with_details(json!({ "timeout_ms": timeout_ms })),
        FetchError::Request(msg) => ApiError::new(ErrorCode::FetchError, msg.clone()),
        FetchError::Browser(msg) => ApiError::new(
            ErrorCode::FetchError,
            format!("Browser rendering failed: {msg}"),
        ),
        FetchError::BrowserUnavailable => ApiError::new(
            ErrorCode::FetchError,
            "Browser rendering is not available",
        ),
    }
}

/// Rebuild a response from a stored page row.
pub fn response_from_page(page: &PageRow, include_links: bool, layer: CacheLayer) -> ScrapeResponse {
    ScrapeResponse {
        url: page.url.clone(),
        canonical_url: page
            .canonical_url
            .clone()
            .unwrap_or_else(|| page.url.clone()),
        status_code: page.status_code.unwrap_or(200) as u16,
        title: page.title.clone(),
        markdown: page.markdown.clone().unwrap_or_default(),
        metadata: PageMetadata {
            description: page.description.clone(),
            og_image: page.og_image.clone(),
            author: None,
            published_at: None,
            site_name: page.site_name.clone(),
            language: page.language.clone(),
            favicon_url: page.favicon_url.clone(),
            word_count: page.word_count,
            read_time_minutes: page.read_time_minutes,
            fetch_duration_ms: page.fetch_duration_ms.unwrap_or(0),
            renderer: page
                .renderer
                .clone()
                .unwrap_or_else(|| Renderer::Http.as_str().to_string()),
        },
        links: include_links.then(|| Links {
            internal: page.links_internal.clone().unwrap_or_default(),
            external: page.links_external.clone().unwrap_or_default(),
        }),
        raw_html: None,
        cached: true,
        cache_layer: layer,
        request_id: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RenderMode;
    use std::collections::HashMap;

    fn engine() -> Engine {
        Engine::for_tests(Arc::new(Config::for_tests())).expect("lazy engine")
    }

    fn html_fetch(body: &str) -> FetchResult {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        FetchResult {
            status_code: 200,
            headers,
            text: body.to_string(),
            raw_bytes: body.as_bytes().to_vec(),
            final_url: "https://example.com/page".to_string(),
            duration_ms: 42,
            renderer: Renderer::Http,
        }
    }

    fn scrape_req() -> ScrapeRequest {
        ScrapeRequest {
            url: "https://example.com/page".to_string(),
            respect_robots: false,
            use_playwright: RenderMode::Auto,
            include_links: true,
            include_raw_html: false,
            timeout_ms: 20000,
            cache_ttl_seconds: None,
            force_refresh: false,
        }
    }

    #[tokio::test]
    async fn test_assemble_builds_page_and_response() {
        let eng = engine();
        let html = r#"<html><head><title>T</title></head>
            <body><h1>H</h1><p>word1 word2</p><a href="/next">next</a></body></html>"#;
        let fetched = html_fetch(html);

        let (page, resp) = eng.assemble(
            "https://example.com/page",
            "hash123",
            &scrape_req(),
            None,
            &fetched,
        );

        assert_eq!(page.url, "https://example.com/page");
        assert_eq!(resp.title.as_deref(), Some("T"));
        assert!(resp.markdown.contains("# H"));
        assert!(resp.markdown.contains("word1 word2"));
        assert_eq!(resp.metadata.word_count, Some(3)); // "word1 word2" + link text
        assert_eq!(resp.metadata.renderer, "http");
        assert_eq!(resp.status_code, 200);
        assert!(!resp.cached);
        assert_eq!(
            resp.links.as_ref().unwrap().internal,
            vec!["https://example.com/next".to_string()]
        );
        assert_eq!(page.content_hash.as_deref(), Some(resp_hash(html).as_str()));
    }

    fn resp_hash(body: &str) -> String {
        urls::sha256_hex_bytes(body.as_bytes())
    }

    #[tokio::test]
    async fn test_assemble_hash_hit_reuses_stored_fields() {
        let eng = engine();
        let html = "<html><body><p>stable content body</p></body></html>";
        let fetched = html_fetch(html);
        let hash = resp_hash(html);

        let prev = PageRow {
            id: uuid::Uuid::new_v4(),
            url: "https://example.com/page".to_string(),
            canonical_url: Some("https://example.com/page".to_string()),
            url_hash: "hash123".to_string(),
            content_hash: Some(hash.clone()),
            status_code: Some(200),
            title: Some("Stored title".to_string()),
            description: Some("Stored description".to_string()),
            markdown: Some("stored markdown".to_string()),
            raw_html: None,
            renderer: Some("http".to_string()),
            links_internal: Some(vec!["https://example.com/a".to_string()]),
            links_external: Some(vec![]),
            word_count: Some(2),
            read_time_minutes: Some(0),
            fetch_duration_ms: Some(10),
            og_image: None,
            favicon_url: None,
            site_name: None,
            language: None,
            fetched_at: Utc::now(),
            error_code: None,
            error_message: None,
        };

        let before = eng.metrics.hash_hits_total.get();
        let (page, resp) = eng.assemble(
            "https://example.com/page",
            "hash123",
            &scrape_req(),
            Some(&prev),
            &fetched,
        );
        assert_eq!(eng.metrics.hash_hits_total.get(), before + 1);
        assert_eq!(resp.markdown, "stored markdown");
        assert_eq!(resp.title.as_deref(), Some("Stored title"));
        assert_eq!(page.markdown.as_deref(), Some("stored markdown"));
        assert_eq!(resp.metadata.word_count, Some(2));
        // Fresh fetch facts still win where they should.
        assert_eq!(resp.metadata.fetch_duration_ms, 42);
    }

    #[tokio::test]
    async fn test_assemble_pdf_branch_on_content_type() {
        let eng = engine();
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/pdf".to_string());
        let fetched = FetchResult {
            status_code: 200,
            headers,
            text: String::new(),
            raw_bytes: b"not really a pdf".to_vec(),
            final_url: "https://example.com/doc.pdf".to_string(),
            duration_ms: 5,
            renderer: Renderer::Http,
        };

        // Invalid PDF bytes degrade to an empty body, not a panic.
        let (page, resp) = eng.assemble(
            "https://example.com/doc.pdf",
            "hash",
            &scrape_req(),
            None,
            &fetched,
        );
        assert!(resp.links.is_none());
        assert_eq!(page.links_internal, None);
        assert_eq!(resp.metadata.renderer, "http");
    }

    #[test]
    fn test_fetch_error_mapping() {
        let api = fetch_error_to_api(&FetchError::Timeout, 1500);
        assert_eq!(api.code, ErrorCode::FetchTimeout);
        assert!(api.message.contains("1500"));

        let api = fetch_error_to_api(&FetchError::Request("boom".to_string()), 1500);
        assert_eq!(api.code, ErrorCode::FetchError);

        let api = fetch_error_to_api(&FetchError::BrowserUnavailable, 1500);
        assert_eq!(api.code, ErrorCode::FetchError);
    }

    #[test]
    fn test_response_from_page_defaults() {
        let page = PageRow {
            id: uuid::Uuid::new_v4(),
            url: "https://example.com".to_string(),
            canonical_url: None,
            url_hash: "h".to_string(),
            content_hash: None,
            status_code: None,
            title: None,
            description: None,
            markdown: Some("body".to_string()),
            raw_html: None,
            renderer: None,
            links_internal: None,
            links_external: None,
            word_count: None,
            read_time_minutes: None,
            fetch_duration_ms: None,
            og_image: None,
            favicon_url: None,
            site_name: None,
            language: None,
            fetched_at: Utc::now(),
            error_code: None,
            error_message: None,
        };
        let resp = response_from_page(&page, true, CacheLayer::Db);
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.canonical_url, "https://example.com");
        assert_eq!(resp.metadata.renderer, "http");
        assert!(resp.cached);
        assert!(matches!(resp.cache_layer, CacheLayer::Db));
        assert_eq!(resp.links.as_ref().unwrap().internal.len(), 0);
    }
}
