//! Admin surface: config summary/validation, provider health, metrics.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::{ApiResponse, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/config/summary", get(config_summary))
        .route("/api/config/validate", get(config_validate))
        .route("/api/providers/health", get(providers_health))
        .route("/api/metrics/summary", get(metrics_summary))
}

async fn config_summary(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    Json(ApiResponse::success(state.config.summary()))
}

async fn config_validate(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let offenders = state.config.validate();
    Json(ApiResponse::success(json!({
        "valid": offenders.is_empty(),
        "offenders": offenders,
    })))
}

async fn providers_health(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let snapshot = state.router.health().snapshot();
    let unhealthy = state.router.health().unhealthy();
    Json(ApiResponse::success(json!({
        "providers": snapshot,
        "unhealthy": unhealthy,
    })))
}

async fn metrics_summary(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let metrics = state.metrics.snapshot();
    let cache = state.cache.stats();
    Json(ApiResponse::success(json!({
        "operations": metrics.operations,
        "slow_calls": metrics.slow_calls,
        "token_usage": metrics.token_usage,
        "cache": {
            "hits": cache.hits,
            "misses": cache.misses,
            "hit_rate": cache.hit_rate(),
            "l1_size": cache.l1_size,
            "l2_enabled": cache.l2_enabled,
        },
    })))
}
