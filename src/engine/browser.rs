use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetBlockedUrLsParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::engine::fetcher::{FetchError, FetchResult};
use crate::models::Renderer;

/// Subresource patterns blocked before navigation to keep page loads cheap.
const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.ico", "*.bmp", "*.tiff", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.eot", "*.mp4", "*.webm", "*.ogg", "*.mp3", "*.wav",
    "*.avi", "*.mov", "*.css",
];

/// Short settle interval after navigation so late scripts can inject content.
const SETTLE_INTERVAL: Duration = Duration::from_secs(2);

/// Init script that hides the most common automation tells.
const STEALTH_INIT_JS: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3] });
"#;

/// One process-wide headless Chromium, shared by all renders. Concurrency is
/// bounded by a semaphore of page permits; a failed page is discarded and its
/// permit restored when the guard drops.
pub struct BrowserPool {
    browser: Mutex<Browser>,
    semaphore: Arc<Semaphore>,
    handler_task: JoinHandle<()>,
    global_timeout_ms: u64,
    user_agent: String,
    stealth: bool,
}

impl std::fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserPool")
            .field("permits", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

impl BrowserPool {
    pub async fn launch(config: &Config) -> Result<Self, FetchError> {
        let browser_config = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-setuid-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .window_size(1280, 800)
            .build()
            .map_err(FetchError::Browser)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        tracing::info!(
            max_contexts = config.browser_max_contexts,
            "Browser pool started"
        );

        Ok(BrowserPool {
            browser: Mutex::new(browser),
            semaphore: Arc::new(Semaphore::new(config.browser_max_contexts)),
            handler_task,
            global_timeout_ms: config.browser_timeout_ms,
            user_agent: config.user_agent.clone(),
            stealth: config.browser_stealth,
        })
    }

    /// Render a page and capture the serialized DOM.
    ///
    /// Navigation uses `min(global_browser_timeout, caller timeout)`; after
    /// `goto` a short settle sleep lets late scripts inject before capture.
    pub async fn fetch(&self, url: &str, timeout_ms: u64) -> Result<FetchResult, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;

        let start = Instant::now();

        let page = {
            let browser = self.browser.lock().await;
            browser
                .new_page("about:blank")
                .await
                .map_err(|e| FetchError::Browser(e.to_string()))?
        };

        let result = self.drive_page(&page, url, timeout_ms, start).await;

        // Discard the page whatever happened; the permit restores on drop.
        if let Err(e) = page.close().await {
            tracing::debug!(error = %e, "Failed to close browser page");
        }

        result
    }

    async fn drive_page(
        &self,
        page: &Page,
        url: &str,
        timeout_ms: u64,
        start: Instant,
    ) -> Result<FetchResult, FetchError> {
        if let Err(e) = page.set_user_agent(self.user_agent.clone()).await {
            tracing::debug!(error = %e, "Failed to set browser user agent");
        }

        if self.stealth {
            let script = AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(STEALTH_INIT_JS)
                .build()
                .map_err(FetchError::Browser)?;
            if let Err(e) = page.execute(script).await {
                tracing::debug!(error = %e, "Failed to apply stealth init script");
            }
        }

        let blocked = SetBlockedUrLsParams::new(
            BLOCKED_RESOURCE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>(),
        );
        if let Err(e) = page.execute(blocked).await {
            tracing::debug!(error = %e, "Failed to block heavy subresources");
        }

        let nav_timeout = Duration::from_millis(self.global_timeout_ms.min(timeout_ms));
        match tokio::time::timeout(nav_timeout, page.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(FetchError::Browser(e.to_string())),
            Err(_) => return Err(FetchError::Timeout),
        }

        tokio::time::sleep(SETTLE_INTERVAL).await;

        let content = page
            .content()
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?;

        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());

        // CDP does not expose the main response status on this path; a
        // navigation that produced a DOM is reported as 200.
        Ok(FetchResult {
            status_code: 200,
            headers,
            raw_bytes: content.as_bytes().to_vec(),
            text: content,
            final_url,
            duration_ms: start.elapsed().as_millis() as i64,
            renderer: Renderer::Browser,
        })
    }

    /// Close the shared browser and stop its event handler.
    pub async fn shutdown(&self) {
        let mut browser = self.browser.lock().await;
        if let Err(e) = browser.close().await {
            tracing::warn!(error = %e, "Failed to close browser");
        }
        self.handler_task.abort();
        tracing::info!("Browser pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_patterns_cover_heavy_assets() {
        for ext in ["*.png", "*.woff2", "*.mp4", "*.css"] {
            assert!(BLOCKED_RESOURCE_PATTERNS.contains(&ext));
        }
        // HTML and scripts are never blocked: the DOM needs them.
        assert!(!BLOCKED_RESOURCE_PATTERNS.contains(&"*.html"));
        assert!(!BLOCKED_RESOURCE_PATTERNS.contains(&"*.js"));
    }

    #[test]
    fn test_stealth_script_shape() {
        assert!(STEALTH_INIT_JS.contains("webdriver"));
        assert!(STEALTH_INIT_JS.contains("navigator"));
    }
}
