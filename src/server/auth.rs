use axum::http::HeaderMap;
use serde_json::json;

use crate::engine::throttle::check_rate_limit;
use crate::engine::urls::sha256_hex;
use crate::error::{ApiError, ErrorCode};
use crate::storage::ApiKeyRow;
use crate::AppState;

/// Authenticate the `X-API-Key` header and admit the request through the
/// per-credential sliding window. Only admitted requests are recorded in
/// the window; the raw key never touches storage.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
) -> Result<ApiKeyRow, ApiError> {
    let raw_key = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError::unauthorized("Missing API key").with_request_id(request_id)
        })?;

    let key_hash = sha256_hex(raw_key);
    let api_key = state
        .engine
        .store
        .api_key_by_hash(&key_hash)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?
        .filter(|k| k.is_active)
        .ok_or_else(|| {
            ApiError::unauthorized("Invalid API key").with_request_id(request_id)
        })?;

    let limit = if api_key.rate_limit > 0 {
        api_key.rate_limit as u32
    } else {
        state.engine.config.default_rate_limit
    };

    if !check_rate_limit(&state.engine.kv, &api_key.key_hash, limit).await {
        state.engine.metrics.rate_limit_total.inc();
        return Err(ApiError::new(
            ErrorCode::RateLimited,
            "API key over rate limit",
        )
        .with_details(json!({ "limit_per_minute": limit }))
        .with_request_id(request_id));
    }

    state.engine.store.touch_api_key(api_key.id).await;

    Ok(api_key)
}

pub async fn require_scope(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
    scope: &str,
) -> Result<ApiKeyRow, ApiError> {
    let api_key = authenticate(state, headers, request_id).await?;
    if !api_key.has_scope(scope) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "API key missing required scope",
        )
        .with_details(json!({ "required_scope": scope }))
        .with_request_id(request_id));
    }
    Ok(api_key)
}

pub async fn require_any_scope(
    state: &AppState,
    headers: &HeaderMap,
    request_id: &str,
    scopes: &[&str],
) -> Result<ApiKeyRow, ApiError> {
    let api_key = authenticate(state, headers, request_id).await?;
    if !scopes.iter().any(|s| api_key.has_scope(s)) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "API key missing required scope",
        )
        .with_details(json!({ "required_scopes": scopes }))
        .with_request_id(request_id));
    }
    Ok(api_key)
}
