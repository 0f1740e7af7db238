use std::sync::OnceLock;
use url::Url;

use crate::engine::browser::BrowserPool;
use crate::engine::fetcher::{FetchError, FetchResult, HttpFetcher};
use crate::metrics::Metrics;
use crate::models::RenderMode;

/// Hosts that never render usefully without JavaScript.
const ALWAYS_BROWSER_HOSTS: &[&str] = &[
    "twitter.com",
    "x.com",
    "instagram.com",
    "facebook.com",
    "linkedin.com",
];

/// Escalate when the HTML-stripped body has fewer words than this.
const MIN_WORD_COUNT: usize = 150;

const SPA_MARKERS: &[&str] = &[
    r#"id="root""#,
    r#"id="app""#,
    r#"id="__next""#,
    "window.__next_data__",
    "window.__nuxt__",
    "__remix_manifest",
];

fn tag_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"<[^>]+>").expect("valid regex"))
}

/// Escalation predicate for `auto` mode: thin body, SPA shell markers, or a
/// known browser-only host.
pub fn needs_browser(html: &str, host: Option<&str>) -> bool {
    if let Some(host) = host {
        let host = host.strip_prefix("www.").unwrap_or(host);
        if ALWAYS_BROWSER_HOSTS.contains(&host) {
            return true;
        }
    }

    let text = tag_re().replace_all(html, " ");
    if text.split_whitespace().count() < MIN_WORD_COUNT {
        return true;
    }

    let lowered = html.to_lowercase();
    SPA_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Route a fetch between the HTTP fetcher and the browser.
///
/// `always` uses the browser only; `never` uses HTTP only; `auto` starts with
/// HTTP and escalates when the result looks like an unrendered shell. Non-HTML
/// responses are returned as-is.
pub async fn fetch_routed(
    fetcher: &HttpFetcher,
    browser: Option<&BrowserPool>,
    metrics: &Metrics,
    url: &str,
    mode: RenderMode,
    timeout_ms: u64,
) -> Result<FetchResult, FetchError> {
    match mode {
        RenderMode::Always => {
            let pool = browser.ok_or(FetchError::BrowserUnavailable)?;
            let result = pool.fetch(url, timeout_ms).await?;
            metrics.record_fetch(
                result.renderer.as_str(),
                result.status_code,
                result.duration_ms as u64,
            );
            Ok(result)
        }
        RenderMode::Never => {
            let result = fetcher.fetch(url, timeout_ms).await?;
            metrics.record_fetch(
                result.renderer.as_str(),
                result.status_code,
                result.duration_ms as u64,
            );
            Ok(result)
        }
        RenderMode::Auto => {
            let first = fetcher.fetch(url, timeout_ms).await?;
            metrics.record_fetch(
                first.renderer.as_str(),
                first.status_code,
                first.duration_ms as u64,
            );

            if !first.content_type().contains("text/html") {
                return Ok(first);
            }

            let host = Url::parse(&first.final_url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_lowercase()));
            if !needs_browser(&first.text, host.as_deref()) {
                return Ok(first);
            }

            let pool = match browser {
                Some(pool) => pool,
                // No browser available: the thin HTTP result is still the
                // best answer we have in auto mode.
                None => return Ok(first),
            };

            metrics.playwright_fallback_total.inc();
            tracing::debug!(url = %url, "Escalating to browser render");

            let rendered = pool.fetch(url, timeout_ms).await?;
            metrics.record_fetch(
                rendered.renderer.as_str(),
                rendered.status_code,
                rendered.duration_ms as u64,
            );
            Ok(rendered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_html() -> String {
        let body = "word ".repeat(300);
        format!("<html><body><p>{body}</p></body></html>")
    }

    #[test]
    fn test_thin_body_escalates() {
        let html = "<html><body><div>tiny</div></body></html>";
        assert!(needs_browser(html, Some("example.com")));
    }

    #[test]
    fn test_rich_body_does_not_escalate() {
        assert!(!needs_browser(&long_html(), Some("example.com")));
    }

    #[test]
    fn test_spa_markers_escalate() {
        let body = "word ".repeat(300);
        for marker in [
            r#"<div id="root"></div>"#,
            r#"<div id="app"></div>"#,
            r#"<div id="__next"></div>"#,
            "<script>window.__NEXT_DATA__ = {}</script>",
            "<script>window.__NUXT__ = {}</script>",
            "<script>__remix_manifest = {}</script>",
        ] {
            let html = format!("<html><body><p>{body}</p>{marker}</body></html>");
            assert!(needs_browser(&html, Some("example.com")), "marker {marker}");
        }
    }

    #[test]
    fn test_always_browser_hosts() {
        assert!(needs_browser(&long_html(), Some("twitter.com")));
        assert!(needs_browser(&long_html(), Some("www.x.com")));
        assert!(!needs_browser(&long_html(), Some("example.org")));
    }

    #[test]
    fn test_word_count_threshold_boundary() {
        let body = "word ".repeat(MIN_WORD_COUNT);
        let html = format!("<html><body><p>{body}</p></body></html>");
        assert!(!needs_browser(&html, None));

        let body = "word ".repeat(MIN_WORD_COUNT - 1);
        let html = format!("<html><body>{body}</body></html>");
        assert!(needs_browser(&html, None));
    }
}
