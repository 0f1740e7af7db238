use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::extractor;
use crate::engine::fetcher::{FetchError, FetchResult};
use crate::engine::urls;
use crate::engine::Engine;
use crate::error::{ApiError, ErrorCode};
use crate::models::{MapRequest, RenderMode};
use crate::storage::NewPage;

/// Resolved crawl inputs. Patterns are compiled once up front; a bad pattern
/// fails the job before any fetch happens.
#[derive(Debug, Clone)]
pub struct CrawlParams {
    pub root_url: String,
    pub max_depth: u32,
    pub max_pages: u32,
    pub include_patterns: Vec<Regex>,
    pub exclude_patterns: Vec<Regex>,
    pub concurrency: usize,
    pub domain_delay_ms: u64,
    pub respect_robots: bool,
    pub render_mode: RenderMode,
    pub timeout_ms: u64,
}

impl CrawlParams {
    pub fn from_request(req: &MapRequest, config: &Config) -> Result<Self, ApiError> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, ApiError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|_| ApiError::validation(format!("Invalid regex pattern: {p}")))
                })
                .collect()
        };

        Ok(CrawlParams {
            root_url: req.url.clone(),
            max_depth: req.max_depth,
            max_pages: req.max_pages,
            include_patterns: compile(&req.include_patterns)?,
            exclude_patterns: compile(&req.exclude_patterns)?,
            concurrency: req.concurrency as usize,
            domain_delay_ms: config.domain_delay_ms,
            respect_robots: req.respect_robots,
            render_mode: req.use_playwright,
            timeout_ms: req.timeout_ms,
        })
    }

    /// Include/exclude semantics: a non-empty include list must match, any
    /// exclude match disqualifies.
    fn allows(&self, url: &str) -> bool {
        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(url))
        {
            return false;
        }
        !self.exclude_patterns.iter().any(|p| p.is_match(url))
    }
}

/// BFS map over one host.
///
/// The frontier is FIFO over `(url, depth)`; `seen` dedupes by normalized URL
/// and bounds the crawl at `max_pages`. Up to `concurrency` fetches run in
/// parallel, each behind the per-host semaphore and politeness delay. Storage
/// writes happen on the driving task, one commit per page, so a polling
/// client observes `pages_discovered` increase monotonically.
pub async fn crawl_site(
    engine: &Arc<Engine>,
    job_id: Uuid,
    params: &CrawlParams,
) -> Result<(), ApiError> {
    let root = urls::normalize(&params.root_url, None)
        .ok_or_else(|| ApiError::validation("Root URL must include a hostname"))?;

    // Root failures fail the job; per-page failures later do not.
    if let Err(e) = urls::validate_ssrf(&root).await {
        if e.code == ErrorCode::SsrfBlocked {
            engine.metrics.ssrf_blocked_total.inc();
        }
        return Err(e);
    }

    let root_host = Url::parse(&root)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .ok_or_else(|| ApiError::validation("Root URL must include a hostname"))?;

    let mut queue: VecDeque<(String, u32)> = VecDeque::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut discovered: i32 = 0;
    queue.push_back((root, 0));

    engine
        .store
        .update_job_progress(job_id, 0, Some(params.max_pages as i32))
        .await?;

    let mut workers: JoinSet<(String, u32, Result<FetchResult, FetchError>)> = JoinSet::new();

    loop {
        // Fill worker slots from the front of the frontier.
        while workers.len() < params.concurrency && seen.len() < params.max_pages as usize {
            let Some((url, depth)) = queue.pop_front() else {
                break;
            };
            if seen.contains(&url) || depth > params.max_depth {
                continue;
            }

            match urls::validate_ssrf(&url).await {
                Ok(()) => {}
                Err(e) => {
                    if e.code == ErrorCode::SsrfBlocked {
                        engine.metrics.ssrf_blocked_total.inc();
                    }
                    tracing::debug!(url = %url, code = e.code.as_str(), "Skipping URL");
                    continue;
                }
            }

            if params.respect_robots && !engine.robots.is_allowed(&url).await {
                engine.metrics.robots_blocked_total.inc();
                tracing::debug!(url = %url, "Blocked by robots.txt");
                continue;
            }

            seen.insert(url.clone());

            let eng = engine.clone();
            let mode = params.render_mode;
            let timeout_ms = params.timeout_ms;
            let concurrency = params.concurrency;
            let delay_ms = params.domain_delay_ms;
            let host = Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_default();

            workers.spawn(async move {
                let _permit = eng.throttle.acquire(&host, concurrency, delay_ms).await;
                let result = eng.fetch_routed(&url, mode, timeout_ms).await;
                (url, depth, result)
            });
        }

        let Some(joined) = workers.join_next().await else {
            break;
        };

        match joined {
            Ok((url, depth, Ok(fetched))) => {
                let links = record_page(engine, job_id, &url, depth, &fetched).await?;
                discovered += 1;
                engine
                    .store
                    .update_job_progress(job_id, discovered, None)
                    .await?;

                for link in links {
                    let link_host = Url::parse(&link)
                        .ok()
                        .and_then(|u| u.host_str().map(|h| h.to_string()));
                    if link_host.as_deref() != Some(root_host.as_str()) {
                        continue;
                    }
                    if !params.allows(&link) {
                        continue;
                    }
                    if !seen.contains(&link) && depth + 1 <= params.max_depth {
                        queue.push_back((link, depth + 1));
                    }
                }
            }
            Ok((url, depth, Err(e))) => {
                tracing::warn!(url = %url, error = %e, "Crawl fetch failed");
                let api = super::fetch_error_to_api(&e, params.timeout_ms);
                let row = NewPage::error(
                    &url,
                    &urls::url_hash(&url),
                    api.code.as_str(),
                    &api.message,
                );
                // Counted as discovered only when the error row lands.
                if let Ok(page) = engine.store.upsert_page(&row).await {
                    if engine
                        .store
                        .insert_job_page(job_id, page.id, depth as i32)
                        .await
                        .is_ok()
                    {
                        discovered += 1;
                        engine
                            .store
                            .update_job_progress(job_id, discovered, None)
                            .await?;
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Crawl worker panicked");
            }
        }
    }

    tracing::info!(
        job_id = %job_id,
        pages_discovered = discovered,
        "Crawl finished"
    );
    Ok(())
}

/// Store one fetched page and its job edge; returns the internal links for
/// frontier expansion.
async fn record_page(
    engine: &Arc<Engine>,
    job_id: Uuid,
    url: &str,
    depth: u32,
    fetched: &FetchResult,
) -> Result<Vec<String>, ApiError> {
    let base = if fetched.final_url.is_empty() {
        url
    } else {
        &fetched.final_url
    };
    let links = extractor::extract_links(&fetched.text, base);
    let meta = extractor::extract_metadata(&fetched.text, url);

    let canonical = meta
        .canonical_url
        .clone()
        .and_then(|c| urls::normalize(&c, None))
        .or_else(|| urls::normalize(&fetched.final_url, None))
        .unwrap_or_else(|| url.to_string());

    let row = NewPage {
        url: url.to_string(),
        canonical_url: Some(canonical),
        url_hash: urls::url_hash(url),
        status_code: Some(fetched.status_code as i32),
        title: meta.title,
        description: meta.description,
        renderer: Some(fetched.renderer.as_str().to_string()),
        links_internal: Some(links.internal.clone()),
        links_external: Some(links.external.clone()),
        fetch_duration_ms: Some(fetched.duration_ms),
        og_image: meta.og_image,
        favicon_url: meta.favicon_url,
        site_name: meta.site_name,
        language: meta.language,
        ..NewPage::default()
    };

    let page = engine.store.upsert_page_shallow(&row).await?;
    engine
        .store
        .insert_job_page(job_id, page.id, depth as i32)
        .await?;

    Ok(links.internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_with(include: &[&str], exclude: &[&str]) -> CrawlParams {
        let req = MapRequest {
            url: "https://example.com".to_string(),
            max_depth: 2,
            max_pages: 100,
            respect_robots: false,
            use_playwright: RenderMode::Never,
            timeout_ms: 20000,
            include_patterns: include.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: exclude.iter().map(|s| s.to_string()).collect(),
            concurrency: 5,
            force: false,
        };
        CrawlParams::from_request(&req, &Config::for_tests()).unwrap()
    }

    #[test]
    fn test_allows_no_patterns() {
        let p = params_with(&[], &[]);
        assert!(p.allows("https://example.com/anything"));
    }

    #[test]
    fn test_allows_include_required() {
        let p = params_with(&["/blog/"], &[]);
        assert!(p.allows("https://example.com/blog/post-1"));
        assert!(!p.allows("https://example.com/shop/item"));
    }

    #[test]
    fn test_allows_exclude_wins() {
        let p = params_with(&["/blog/"], &["draft"]);
        assert!(p.allows("https://example.com/blog/post"));
        assert!(!p.allows("https://example.com/blog/draft-post"));
    }

    #[test]
    fn test_allows_multiple_includes_any_match() {
        let p = params_with(&["/docs/", "/blog/"], &[]);
        assert!(p.allows("https://example.com/docs/intro"));
        assert!(p.allows("https://example.com/blog/x"));
        assert!(!p.allows("https://example.com/pricing"));
    }

    #[test]
    fn test_from_request_rejects_bad_pattern() {
        let req = MapRequest {
            url: "https://example.com".to_string(),
            max_depth: 1,
            max_pages: 10,
            respect_robots: true,
            use_playwright: RenderMode::Auto,
            timeout_ms: 20000,
            include_patterns: vec!["[unclosed".to_string()],
            exclude_patterns: vec![],
            concurrency: 2,
            force: false,
        };
        assert!(CrawlParams::from_request(&req, &Config::for_tests()).is_err());
    }
}
