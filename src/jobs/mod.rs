use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::crawler::{crawl_site, CrawlParams};
use crate::engine::{urls, Engine};
use crate::error::ApiError;
use crate::models::{
    AgentExtractRequest, JobStatus, JobType, MapRequest, RenderMode, ScrapeRequest, ScrapedDoc,
    SearchHitModel,
};
use crate::storage::JobRow;

/// Serialize JSON with recursively sorted object keys and no whitespace.
/// Idempotency keys depend on this being stable across key order.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*key).clone()).to_string());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// `SHA256(credential_id : type : canonical_json(params))`.
pub fn idempotency_key(api_key_id: Uuid, job_type: JobType, params: &Value) -> String {
    urls::sha256_hex(&format!(
        "{api_key_id}:{}:{}",
        job_type.as_str(),
        canonical_json(params)
    ))
}

/// A job failure with the error_code that lands on the row.
#[derive(Debug)]
struct JobFailure {
    code: String,
    message: String,
}

impl From<ApiError> for JobFailure {
    fn from(e: ApiError) -> Self {
        JobFailure {
            code: e.code.as_str().to_string(),
            message: e.message,
        }
    }
}

/// Owns the worker loop and the cleanup sweeper. Jobs are durable rows; this
/// channel only carries wake-ups for the in-process worker.
pub struct JobManager {
    engine: Arc<Engine>,
    tx: mpsc::Sender<Uuid>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager").finish_non_exhaustive()
    }
}

impl JobManager {
    pub fn new(engine: Arc<Engine>) -> Self {
        let (tx, rx) = mpsc::channel::<Uuid>(64);
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::process_loop(engine.clone(), rx, shutdown.clone()));
        tokio::spawn(Self::sweeper_loop(engine.clone(), shutdown.clone()));

        JobManager {
            engine,
            tx,
            shutdown,
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Submit a job with idempotency: an existing non-failed job with the
    /// same key is returned instead of inserting, unless `force` is set.
    /// The key is computed over `params` (the request body); `stored_params`
    /// may carry extra worker inputs to persist alongside it. Returns the
    /// job row and whether it was an idempotent hit.
    pub async fn submit(
        &self,
        api_key_id: Uuid,
        job_type: JobType,
        params: Value,
        stored_params: Option<Value>,
        force: bool,
    ) -> Result<(JobRow, bool), ApiError> {
        let key = idempotency_key(api_key_id, job_type, &params);
        let stored = stored_params.unwrap_or(params);

        if !force {
            if let Some(existing) = self.engine.store.job_by_idempotency_key(&key).await? {
                if existing.status() != JobStatus::Failed {
                    return Ok((existing, true));
                }
            }
        }

        let job = match self
            .engine
            .store
            .insert_job(api_key_id, job_type, &stored, &key)
            .await
        {
            Ok(job) => job,
            Err(sqlx::Error::Database(db))
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                // Raced or forced against a live job with the same key; the
                // stored job wins.
                return self
                    .engine
                    .store
                    .job_by_idempotency_key(&key)
                    .await?
                    .map(|job| (job, true))
                    .ok_or_else(|| ApiError::internal("Job insert conflict"));
            }
            Err(e) => return Err(e.into()),
        };

        self.engine
            .metrics
            .record_job_status(job_type.as_str(), "queued");

        if self.tx.send(job.id).await.is_err() {
            tracing::error!(job_id = %job.id, "Worker queue closed, job stays queued");
        }

        Ok((job, false))
    }

    async fn process_loop(
        engine: Arc<Engine>,
        mut rx: mpsc::Receiver<Uuid>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => {
                    match received {
                        Some(job_id) => {
                            tokio::spawn(Self::run_job(engine.clone(), job_id));
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Drive one job: queued -> running -> completed/failed, under the hard
    /// job timeout.
    async fn run_job(engine: Arc<Engine>, job_id: Uuid) {
        let job = match engine.store.job_by_id(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
                return;
            }
        };

        if job.status() != JobStatus::Queued {
            return;
        }

        let Some(job_type) = job.job_type() else {
            let _ = engine
                .store
                .mark_job_failed(job_id, "UNSUPPORTED_JOB_TYPE", "Unknown job type")
                .await;
            return;
        };

        if let Err(e) = engine.store.mark_job_running(job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark job running");
            return;
        }

        let type_label = job_type.as_str();
        engine.metrics.active_jobs.with_label_values(&[type_label]).inc();
        tracing::info!(job_id = %job_id, job_type = type_label, "Job started");

        let timeout = Duration::from_secs(engine.config.job_timeout_secs);
        let outcome = tokio::time::timeout(timeout, Self::dispatch(&engine, &job, job_type)).await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = engine.store.mark_job_completed(job_id).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job completed");
                }
                engine.metrics.record_job_status(type_label, "completed");
                tracing::info!(job_id = %job_id, "Job completed");
            }
            Ok(Err(failure)) => {
                if let Err(e) = engine
                    .store
                    .mark_job_failed(job_id, &failure.code, &failure.message)
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed");
                }
                engine.metrics.record_job_status(type_label, "failed");
                tracing::warn!(job_id = %job_id, code = %failure.code, "Job failed");
            }
            Err(_) => {
                if let Err(e) = engine
                    .store
                    .mark_job_failed(job_id, "JOB_TIMEOUT", "Worker exceeded job timeout")
                    .await
                {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job failed");
                }
                engine.metrics.record_job_status(type_label, "failed");
                tracing::warn!(job_id = %job_id, "Job timed out");
            }
        }

        engine.metrics.active_jobs.with_label_values(&[type_label]).dec();
    }

    async fn dispatch(
        engine: &Arc<Engine>,
        job: &JobRow,
        job_type: JobType,
    ) -> Result<(), JobFailure> {
        match job_type {
            JobType::Map => Self::run_map(engine, job).await,
            JobType::AgentExtract => Self::run_agent_extract(engine, job).await,
            JobType::SearchScrape => Self::run_search_scrape(engine, job).await,
        }
    }

    async fn run_map(engine: &Arc<Engine>, job: &JobRow) -> Result<(), JobFailure> {
        let request: MapRequest = serde_json::from_value(job.input_params.clone())
            .map_err(|e| JobFailure {
                code: "VALIDATION_ERROR".to_string(),
                message: format!("Bad map params: {e}"),
            })?;
        let params = CrawlParams::from_request(&request, &engine.config)?;
        crawl_site(engine, job.id, &params).await?;
        Ok(())
    }

    async fn run_agent_extract(engine: &Arc<Engine>, job: &JobRow) -> Result<(), JobFailure> {
        let request: AgentExtractRequest = serde_json::from_value(job.input_params.clone())
            .map_err(|e| JobFailure {
                code: "VALIDATION_ERROR".to_string(),
                message: format!("Bad agent params: {e}"),
            })?;

        let llm = engine.llm.as_ref().ok_or_else(|| JobFailure {
            code: "LLM_ERROR".to_string(),
            message: "No LLM is configured".to_string(),
        })?;

        let scraped = engine
            .scrape(&ScrapeRequest {
                url: request.url.clone(),
                respect_robots: request.respect_robots,
                use_playwright: request.use_playwright,
                include_links: false,
                include_raw_html: false,
                timeout_ms: request.timeout_ms,
                cache_ttl_seconds: None,
                force_refresh: false,
            })
            .await?;

        let data = llm
            .extract_structured(&scraped.markdown, &request.prompt, request.schema.as_ref())
            .await
            .map_err(|e| JobFailure {
                code: "LLM_ERROR".to_string(),
                message: e.to_string(),
            })?;

        let page_id = match urls::normalize(&request.url, None) {
            Some(normalized) => engine
                .store
                .page_by_url_hash(&urls::url_hash(&normalized))
                .await
                .ok()
                .flatten()
                .map(|p| p.id),
            None => None,
        };

        engine
            .store
            .insert_extraction(job.id, page_id, &data, &request.prompt)
            .await
            .map_err(ApiError::from)?;
        Ok(())
    }

    /// Two shapes share this job type: a search batch (params carry `hits`)
    /// and a deferred single scrape (params are a scrape request).
    async fn run_search_scrape(engine: &Arc<Engine>, job: &JobRow) -> Result<(), JobFailure> {
        if let Some(hits) = job.input_params.get("hits") {
            let hits: Vec<SearchHitModel> =
                serde_json::from_value(hits.clone()).map_err(|e| JobFailure {
                    code: "VALIDATION_ERROR".to_string(),
                    message: format!("Bad search hits: {e}"),
                })?;
            let respect_robots = job
                .input_params
                .get("respect_robots")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let scrapes = hits.iter().map(|hit| {
                let engine = engine.clone();
                let url = hit.url.clone();
                async move {
                    engine
                        .scrape(&ScrapeRequest {
                            url,
                            respect_robots,
                            use_playwright: RenderMode::Auto,
                            include_links: false,
                            include_raw_html: false,
                            timeout_ms: 20000,
                            cache_ttl_seconds: None,
                            force_refresh: false,
                        })
                        .await
                        .ok()
                }
            });
            let outcomes = futures::future::join_all(scrapes).await;

            let results: Vec<Value> = hits
                .iter()
                .zip(outcomes)
                .map(|(hit, scraped)| {
                    let doc = scraped.map(|s| ScrapedDoc {
                        markdown: s.markdown,
                        title: s.title,
                    });
                    json!({
                        "rank": hit.rank,
                        "url": hit.url,
                        "scraped": doc,
                    })
                })
                .collect();

            engine
                .store
                .insert_extraction(job.id, None, &json!({ "results": results }), "Search background scrape")
                .await
                .map_err(ApiError::from)?;
            return Ok(());
        }

        // Deferred single scrape.
        let request: ScrapeRequest = serde_json::from_value(job.input_params.clone())
            .map_err(|e| JobFailure {
                code: "VALIDATION_ERROR".to_string(),
                message: format!("Bad scrape params: {e}"),
            })?;
        let response = engine.scrape(&request).await?;

        let page_id = match urls::normalize(&request.url, None) {
            Some(normalized) => engine
                .store
                .page_by_url_hash(&urls::url_hash(&normalized))
                .await
                .ok()
                .flatten()
                .map(|p| p.id),
            None => None,
        };

        let data = serde_json::to_value(&response).unwrap_or_else(|_| json!({}));
        engine
            .store
            .insert_extraction(job.id, page_id, &data, "Deferred scrape")
            .await
            .map_err(ApiError::from)?;
        Ok(())
    }

    /// Periodic cleanup: purge terminal jobs older than the interval and
    /// promote stale `running` jobs to `failed`. Errors are logged and
    /// swallowed; the first pass runs at startup so crashes cannot leave
    /// jobs running forever.
    async fn sweeper_loop(engine: Arc<Engine>, shutdown: CancellationToken) {
        let interval_hours = engine.config.job_cleanup_interval_hours.max(1);
        let interval = Duration::from_secs(interval_hours * 3600);
        tracing::info!(interval_hours, "Cleanup sweeper started");

        loop {
            let stale_cutoff =
                Utc::now() - ChronoDuration::seconds(engine.config.job_timeout_secs as i64);
            match engine.store.fail_stale_running_jobs(stale_cutoff).await {
                Ok(0) => {}
                Ok(n) => tracing::warn!(count = n, "Promoted stale running jobs to failed"),
                Err(e) => tracing::error!(error = %e, "Stale job promotion failed"),
            }

            let expiry_cutoff = Utc::now() - ChronoDuration::hours(interval_hours as i64);
            match engine.store.delete_expired_jobs(expiry_cutoff).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "Purged expired jobs"),
                Err(e) => tracing::error!(error = %e, "Job purge failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"d":4,"c":3}}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":4},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_no_whitespace_and_arrays() {
        let v: Value = serde_json::from_str(r#"{"list":[1, 2, {"y":2,"x":1}]}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"list":[1,2,{"x":1,"y":2}]}"#);
    }

    #[test]
    fn test_idempotency_key_stable_across_key_order() {
        let id = Uuid::new_v4();
        let a: Value = serde_json::from_str(r#"{"url":"https://example.com","max_depth":1}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"max_depth":1,"url":"https://example.com"}"#).unwrap();
        assert_eq!(
            idempotency_key(id, JobType::Map, &a),
            idempotency_key(id, JobType::Map, &b)
        );
    }

    #[test]
    fn test_idempotency_key_varies_by_type_and_owner() {
        let params: Value = serde_json::from_str(r#"{"url":"https://example.com"}"#).unwrap();
        let id = Uuid::new_v4();
        assert_ne!(
            idempotency_key(id, JobType::Map, &params),
            idempotency_key(id, JobType::AgentExtract, &params)
        );
        assert_ne!(
            idempotency_key(id, JobType::Map, &params),
            idempotency_key(Uuid::new_v4(), JobType::Map, &params)
        );
    }

    #[test]
    fn test_canonical_json_escapes_keys() {
        let v: Value = serde_json::from_str(r#"{"a\"b": 1}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"a\"b":1}"#);
    }
}
