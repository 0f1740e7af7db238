use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ApiError;

// --- Closed enums ---

/// Which fetcher produced the final document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Renderer {
    Http,
    Browser,
}

impl Renderer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Renderer::Http => "http",
            Renderer::Browser => "browser",
        }
    }
}

/// Render routing mode requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Auto,
    Always,
    Never,
}

/// Which cache tier served a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLayer {
    None,
    Redis,
    Db,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Map,
    AgentExtract,
    SearchScrape,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Map => "map",
            JobType::AgentExtract => "agent_extract",
            JobType::SearchScrape => "search_scrape",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "map" => Some(JobType::Map),
            "agent_extract" => Some(JobType::AgentExtract),
            "search_scrape" => Some(JobType::SearchScrape),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

// --- Scrape ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub url: String,
    #[serde(default)]
    pub respect_robots: bool,
    #[serde(default)]
    pub use_playwright: RenderMode,
    #[serde(default = "default_true")]
    pub include_links: bool,
    #[serde(default)]
    pub include_raw_html: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub cache_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub force_refresh: bool,
}

impl ScrapeRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_url_format(&self.url)?;
        validate_range("timeout_ms", self.timeout_ms, 1000, 60000)?;
        if let Some(ttl) = self.cache_ttl_seconds {
            validate_range("cache_ttl_seconds", ttl, 0, 86400)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Links {
    pub internal: Vec<String>,
    pub external: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMetadata {
    pub description: Option<String>,
    pub og_image: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub site_name: Option<String>,
    pub language: Option<String>,
    pub favicon_url: Option<String>,
    pub word_count: Option<i32>,
    pub read_time_minutes: Option<i32>,
    pub fetch_duration_ms: i64,
    pub renderer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResponse {
    pub url: String,
    pub canonical_url: String,
    pub status_code: u16,
    pub title: Option<String>,
    pub markdown: String,
    pub metadata: PageMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_html: Option<String>,
    pub cached: bool,
    pub cache_layer: CacheLayer,
    #[serde(default)]
    pub request_id: String,
}

// --- Map ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRequest {
    pub url: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    #[serde(default)]
    pub use_playwright: RenderMode,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default, skip_serializing)]
    pub force: bool,
}

impl MapRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_url_format(&self.url)?;
        validate_range("max_depth", self.max_depth as u64, 0, 5)?;
        validate_range("max_pages", self.max_pages as u64, 1, 1000)?;
        validate_range("concurrency", self.concurrency as u64, 1, 10)?;
        validate_range("timeout_ms", self.timeout_ms, 1000, 60000)?;
        for p in self.include_patterns.iter().chain(&self.exclude_patterns) {
            regex::Regex::new(p)
                .map_err(|_| ApiError::validation(format!("Invalid regex pattern: {p}")))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_discovered: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_total: Option<i32>,
    pub request_id: String,
}

// --- Agent extraction ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExtractRequest {
    pub url: String,
    pub prompt: String,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub use_playwright: RenderMode,
    #[serde(default)]
    pub respect_robots: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing)]
    pub force: bool,
}

impl AgentExtractRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_url_format(&self.url)?;
        if self.prompt.trim().is_empty() {
            return Err(ApiError::validation("prompt must not be empty"));
        }
        validate_range("timeout_ms", self.timeout_ms, 1000, 60000)?;
        if let Some(schema) = &self.schema {
            if !schema.is_object() {
                return Err(ApiError::validation("schema must be a JSON object"));
            }
        }
        Ok(())
    }
}

// --- Search ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_num_results")]
    pub num_results: u32,
    #[serde(default)]
    pub scrape_top_n: u32,
    #[serde(default)]
    pub respect_robots: bool,
}

impl SearchRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.query.trim().is_empty() {
            return Err(ApiError::validation("query must not be empty"));
        }
        validate_range("num_results", self.num_results as u64, 1, 20)?;
        validate_range("scrape_top_n", self.scrape_top_n as u64, 0, 10)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedDoc {
    pub markdown: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHitModel {
    pub rank: u32,
    pub title: String,
    pub url: String,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHitModel>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape_status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchTaskResultResponse {
    pub task_id: String,
    pub scrape_status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

// --- Jobs ---

#[derive(Debug, Clone, Serialize)]
pub struct JobError {
    pub code: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_discovered: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_total: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub request_id: String,
}

/// 202 body returned when work is deferred to a background job.
#[derive(Debug, Clone, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: JobStatus,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// --- serde defaults ---

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    20000
}

fn default_max_depth() -> u32 {
    2
}

fn default_max_pages() -> u32 {
    100
}

fn default_concurrency() -> u32 {
    5
}

fn default_num_results() -> u32 {
    10
}

// --- validation helpers ---

pub fn validate_url_format(raw: &str) -> Result<(), ApiError> {
    let parsed = Url::parse(raw)
        .map_err(|_| ApiError::validation("URL must start with http:// or https://"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::validation(
            "URL must start with http:// or https://",
        ));
    }
    if parsed.host_str().is_none() {
        return Err(ApiError::validation("URL must contain a valid hostname"));
    }
    Ok(())
}

fn validate_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ApiError> {
    if value < min || value > max {
        return Err(ApiError::validation(format!(
            "{field} must be between {min} and {max}"
        ))
        .with_details(serde_json::json!({ "field": field, "min": min, "max": max })));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_request_defaults() {
        let req: ScrapeRequest =
            serde_json::from_str(r#"{"url":"https://example.com"}"#).unwrap();
        assert_eq!(req.use_playwright, RenderMode::Auto);
        assert!(req.include_links);
        assert!(!req.include_raw_html);
        assert_eq!(req.timeout_ms, 20000);
        assert!(!req.force_refresh);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_scrape_request_rejects_bad_url() {
        let req: ScrapeRequest = serde_json::from_str(r#"{"url":"not-a-url"}"#).unwrap();
        assert!(req.validate().is_err());

        let req: ScrapeRequest = serde_json::from_str(r#"{"url":"ftp://host/x"}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_scrape_request_timeout_bounds() {
        let req: ScrapeRequest =
            serde_json::from_str(r#"{"url":"https://example.com","timeout_ms":500}"#).unwrap();
        assert!(req.validate().is_err());

        let req: ScrapeRequest =
            serde_json::from_str(r#"{"url":"https://example.com","timeout_ms":60001}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_map_request_bounds() {
        let req: MapRequest =
            serde_json::from_str(r#"{"url":"https://example.com","max_depth":6}"#).unwrap();
        assert!(req.validate().is_err());

        let req: MapRequest =
            serde_json::from_str(r#"{"url":"https://example.com","max_pages":0}"#).unwrap();
        assert!(req.validate().is_err());

        let req: MapRequest =
            serde_json::from_str(r#"{"url":"https://example.com","concurrency":11}"#).unwrap();
        assert!(req.validate().is_err());

        let req: MapRequest = serde_json::from_str(r#"{"url":"https://example.com"}"#).unwrap();
        assert_eq!(req.max_depth, 2);
        assert_eq!(req.max_pages, 100);
        assert_eq!(req.concurrency, 5);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_map_request_bad_regex() {
        let req: MapRequest = serde_json::from_str(
            r#"{"url":"https://example.com","include_patterns":["[unclosed"]}"#,
        )
        .unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_render_mode_serde() {
        assert_eq!(
            serde_json::from_str::<RenderMode>(r#""always""#).unwrap(),
            RenderMode::Always
        );
        assert!(serde_json::from_str::<RenderMode>(r#""sometimes""#).is_err());
    }

    #[test]
    fn test_job_status_roundtrip() {
        for s in ["queued", "running", "completed", "failed", "cancelled"] {
            assert_eq!(JobStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(JobStatus::parse("crawling").is_none());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_type_roundtrip() {
        for t in ["map", "agent_extract", "search_scrape"] {
            assert_eq!(JobType::parse(t).unwrap().as_str(), t);
        }
    }
}
