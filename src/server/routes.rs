use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::engine::urls;
use crate::error::{ApiError, ErrorCode};
use crate::models::{
    AgentExtractRequest, JobAccepted, JobError, JobStatusResponse, JobType, MapRequest,
    MapResponse, ScrapeRequest, SearchHitModel, SearchRequest, SearchResponse,
    SearchTaskResultResponse,
};
use crate::server::auth;
use crate::server::RequestId;
use crate::storage::JobRow;
use crate::AppState;

fn idempotency_hit(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert("X-Idempotency-Hit", HeaderValue::from_static("true"));
    response
}

/// POST /api/v1/scrape — synchronous single-URL scrape. A fetch timeout with
/// a generous caller deadline degrades to a background job instead of a 504.
pub async fn scrape(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<ScrapeRequest>,
) -> Result<Response, ApiError> {
    let api_key = auth::require_scope(&state, &headers, &request_id, "scrape").await?;
    body.validate()
        .map_err(|e| e.with_request_id(&request_id))?;

    match state.engine.scrape(&body).await {
        Ok(mut response) => {
            response.request_id = request_id;
            Ok(Json(response).into_response())
        }
        Err(e) if e.code == ErrorCode::FetchTimeout && body.timeout_ms >= 5000 => {
            let params = serde_json::to_value(&body)
                .map_err(|_| ApiError::internal("Unserializable request").with_request_id(&request_id))?;
            let (job, _) = state
                .jobs
                .submit(api_key.id, JobType::SearchScrape, params, None, false)
                .await
                .map_err(|e| e.with_request_id(&request_id))?;

            tracing::info!(job_id = %job.id, "Scrape deferred to background job");
            Ok((
                StatusCode::ACCEPTED,
                Json(JobAccepted {
                    job_id: job.id.to_string(),
                    status: job.status(),
                    request_id,
                    message: Some(format!(
                        "Scrape took longer than {}ms, falling back to background worker.",
                        body.timeout_ms
                    )),
                }),
            )
                .into_response())
        }
        Err(e) => Err(e.with_request_id(&request_id)),
    }
}

/// POST /api/v1/map — queue a site-mapping job. Identical bodies under the
/// same credential return the original job with `X-Idempotency-Hit: true`.
pub async fn create_map(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<MapRequest>,
) -> Result<Response, ApiError> {
    let api_key = auth::require_scope(&state, &headers, &request_id, "map").await?;
    body.validate()
        .map_err(|e| e.with_request_id(&request_id))?;

    let normalized = urls::normalize(&body.url, None).unwrap_or_else(|| body.url.clone());
    if let Err(e) = urls::validate_ssrf(&normalized).await {
        if e.code == ErrorCode::SsrfBlocked {
            state.engine.metrics.ssrf_blocked_total.inc();
        }
        return Err(e.with_request_id(&request_id));
    }

    let params = serde_json::to_value(&body)
        .map_err(|_| ApiError::internal("Unserializable request").with_request_id(&request_id))?;
    let (job, idempotent) = state
        .jobs
        .submit(api_key.id, JobType::Map, params, None, body.force)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;

    let payload = MapResponse {
        job_id: job.id.to_string(),
        status: job.status(),
        pages_discovered: Some(job.pages_discovered),
        pages_total: job.pages_total,
        request_id,
    };

    if idempotent {
        Ok(idempotency_hit(
            (StatusCode::OK, Json(payload)).into_response(),
        ))
    } else {
        Ok((StatusCode::ACCEPTED, Json(payload)).into_response())
    }
}

/// GET /api/v1/map/{job_id} — map job status.
pub async fn map_status(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let api_key = auth::require_scope(&state, &headers, &request_id, "map").await?;
    let job = load_owned_job(&state, &job_id, api_key.id, &request_id).await?;

    Ok(Json(MapResponse {
        job_id: job.id.to_string(),
        status: job.status(),
        pages_discovered: Some(job.pages_discovered),
        pages_total: job.pages_total,
        request_id,
    })
    .into_response())
}

/// POST /api/v1/agent/extract — queue an LLM extraction job.
pub async fn agent_extract(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<AgentExtractRequest>,
) -> Result<Response, ApiError> {
    let api_key = auth::require_scope(&state, &headers, &request_id, "scrape").await?;
    body.validate()
        .map_err(|e| e.with_request_id(&request_id))?;

    let normalized = urls::normalize(&body.url, None).unwrap_or_else(|| body.url.clone());
    if let Err(e) = urls::validate_ssrf(&normalized).await {
        if e.code == ErrorCode::SsrfBlocked {
            state.engine.metrics.ssrf_blocked_total.inc();
        }
        return Err(e.with_request_id(&request_id));
    }

    let params = serde_json::to_value(&body)
        .map_err(|_| ApiError::internal("Unserializable request").with_request_id(&request_id))?;
    let (job, idempotent) = state
        .jobs
        .submit(api_key.id, JobType::AgentExtract, params, None, body.force)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;

    let payload = JobAccepted {
        job_id: job.id.to_string(),
        status: job.status(),
        request_id,
        message: None,
    };

    if idempotent {
        Ok(idempotency_hit(
            (StatusCode::OK, Json(payload)).into_response(),
        ))
    } else {
        Ok((StatusCode::ACCEPTED, Json(payload)).into_response())
    }
}

/// POST /api/v1/search — search, optionally queueing a background scrape of
/// the top N results.
pub async fn search(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<SearchRequest>,
) -> Result<Response, ApiError> {
    let api_key = auth::require_scope(&state, &headers, &request_id, "scrape").await?;
    body.validate()
        .map_err(|e| e.with_request_id(&request_id))?;

    let provider = state.engine.search.as_ref().ok_or_else(|| {
        ApiError::new(
            ErrorCode::SearchNotConfigured,
            "No search provider API key is configured",
        )
        .with_request_id(&request_id)
    })?;

    let hits = provider
        .search(&body.query, body.num_results)
        .await
        .map_err(|e| {
            ApiError::new(ErrorCode::SearchError, format!("Search failed: {e}"))
                .with_request_id(&request_id)
        })?;

    let results: Vec<SearchHitModel> = hits
        .into_iter()
        .map(|h| SearchHitModel {
            rank: h.rank,
            title: h.title,
            url: h.url,
            snippet: h.snippet,
        })
        .collect();

    if body.scrape_top_n == 0 {
        return Ok(Json(SearchResponse {
            query: body.query,
            results,
            request_id,
            task_id: None,
            scrape_status: None,
            message: None,
        })
        .into_response());
    }

    let params = serde_json::to_value(&body)
        .map_err(|_| ApiError::internal("Unserializable request").with_request_id(&request_id))?;
    let top: Vec<SearchHitModel> = results
        .iter()
        .take(body.scrape_top_n as usize)
        .cloned()
        .collect();
    let mut stored = params.clone();
    if let Some(map) = stored.as_object_mut() {
        map.insert("hits".to_string(), serde_json::to_value(&top).unwrap_or_default());
    }

    let (job, idempotent) = state
        .jobs
        .submit(
            api_key.id,
            JobType::SearchScrape,
            params,
            Some(stored),
            false,
        )
        .await
        .map_err(|e| e.with_request_id(&request_id))?;

    let message = if idempotent {
        "Background scraping already in progress or completed."
    } else {
        "Search results returned immediately. Poll /api/v1/search/results/{task_id} for scraped content."
    };

    let response = Json(SearchResponse {
        query: body.query,
        results,
        request_id,
        task_id: Some(job.id.to_string()),
        scrape_status: Some(job.status()),
        message: Some(message.to_string()),
    })
    .into_response();

    Ok(if idempotent {
        idempotency_hit(response)
    } else {
        response
    })
}

/// GET /api/v1/search/results/{task_id} — fetch an async search scrape.
pub async fn search_results(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let api_key = auth::require_scope(&state, &headers, &request_id, "scrape").await?;
    let job = load_owned_job(&state, &task_id, api_key.id, &request_id).await?;

    if job.job_type() != Some(JobType::SearchScrape) {
        return Err(ApiError::job_not_found().with_request_id(&request_id));
    }

    let results = if job.status() == crate::models::JobStatus::Completed {
        state
            .engine
            .store
            .extraction_by_job(job.id)
            .await
            .map_err(|e| ApiError::from(e).with_request_id(&request_id))?
            .and_then(|e| e.data.get("results").cloned())
    } else {
        None
    };

    Ok(Json(SearchTaskResultResponse {
        task_id: job.id.to_string(),
        scrape_status: job.status(),
        results,
    })
    .into_response())
}

/// GET /api/v1/jobs/{job_id} — job status for any scope.
pub async fn job_status(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let api_key =
        auth::require_any_scope(&state, &headers, &request_id, &["scrape", "map", "agent"]).await?;
    let job = load_owned_job(&state, &job_id, api_key.id, &request_id).await?;

    Ok(Json(JobStatusResponse {
        job_id: job.id.to_string(),
        job_type: job.job_type().unwrap_or(JobType::SearchScrape),
        status: job.status(),
        created_at: job.created_at.to_rfc3339(),
        started_at: job.started_at.map(|t| t.to_rfc3339()),
        completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        pages_discovered: Some(job.pages_discovered),
        pages_total: job.pages_total,
        error: job.error_code.clone().map(|code| JobError {
            code,
            message: job.error_message.clone(),
        }),
        request_id,
    })
    .into_response())
}

/// GET /api/v1/jobs/{job_id}/results — terminal results, shaped by job type.
pub async fn job_results(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let api_key =
        auth::require_any_scope(&state, &headers, &request_id, &["scrape", "map", "agent"]).await?;
    let job = load_owned_job(&state, &job_id, api_key.id, &request_id).await?;

    if job.status() != crate::models::JobStatus::Completed {
        return Err(ApiError::new(
            ErrorCode::JobNotReady,
            format!("Job is in state '{}'", job.status().as_str()),
        )
        .with_request_id(&request_id));
    }

    match job.job_type() {
        Some(JobType::Map) => {
            let urls = state
                .engine
                .store
                .job_page_urls(job.id)
                .await
                .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;
            Ok(Json(json!({
                "job_id": job.id.to_string(),
                "type": "map",
                "urls": urls,
                "total": urls.len(),
            }))
            .into_response())
        }
        Some(JobType::AgentExtract) => {
            let extraction = state
                .engine
                .store
                .extraction_by_job(job.id)
                .await
                .map_err(|e| ApiError::from(e).with_request_id(&request_id))?
                .ok_or_else(|| {
                    ApiError::new(ErrorCode::JobNotFound, "No extraction results found")
                        .with_request_id(&request_id)
                })?;
            Ok(Json(json!({
                "job_id": job.id.to_string(),
                "type": "agent_extract",
                "data": extraction.data,
            }))
            .into_response())
        }
        Some(JobType::SearchScrape) => {
            let extraction = state
                .engine
                .store
                .extraction_by_job(job.id)
                .await
                .map_err(|e| ApiError::from(e).with_request_id(&request_id))?;
            Ok(Json(json!({
                "job_id": job.id.to_string(),
                "type": "search_scrape",
                "data": extraction.map(|e| e.data),
            }))
            .into_response())
        }
        None => Err(ApiError::new(
            ErrorCode::UnsupportedJobType,
            format!("Results for job type '{}' are not supported", job.job_type),
        )
        .with_request_id(&request_id)),
    }
}

/// GET /health — liveness plus dependency probes. Dependency failures
/// degrade the report, they do not fail it.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.engine.store.ping().await;
    let redis = state.engine.kv.ping().await;
    let status = if database && redis { "ok" } else { "degraded" };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "database": database,
            "redis": redis,
        }
    }))
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics.render(),
    )
}

/// Look up a job by path id. Unknown ids, unparseable ids, and jobs owned by
/// a different credential are all the same 404.
async fn load_owned_job(
    state: &AppState,
    job_id: &str,
    api_key_id: Uuid,
    request_id: &str,
) -> Result<JobRow, ApiError> {
    let id = Uuid::parse_str(job_id)
        .map_err(|_| ApiError::job_not_found().with_request_id(request_id))?;

    let job = state
        .engine
        .store
        .job_by_id(id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?
        .ok_or_else(|| ApiError::job_not_found().with_request_id(request_id))?;

    if job.api_key_id != api_key_id {
        return Err(ApiError::job_not_found().with_request_id(request_id));
    }

    Ok(job)
}
