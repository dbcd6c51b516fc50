//! Analysis task submission, progress, and cancellation.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use market_core::{AnalysisBatch, AnalysisParameters, AnalysisTask};

use crate::{user_id_from, ApiResponse, AppError, AppState};

#[derive(Deserialize)]
pub struct SingleAnalysisRequest {
    pub symbol: String,
    #[serde(default)]
    pub parameters: Option<AnalysisParameters>,
}

#[derive(Deserialize)]
pub struct BatchAnalysisRequest {
    pub title: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub parameters: Option<AnalysisParameters>,
}

#[derive(Serialize)]
pub struct BatchSubmitResponse {
    pub batch: AnalysisBatch,
    pub tasks: Vec<AnalysisTask>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/analysis/single", post(submit_single))
        .route("/api/analysis/batch", post(submit_batch))
        .route("/api/analysis/task/:id", get(get_task))
        .route("/api/analysis/task/:id/cancel", post(cancel_task))
        .route("/api/analysis/batch/:id", get(get_batch))
}

async fn submit_single(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SingleAnalysisRequest>,
) -> Result<Json<ApiResponse<AnalysisTask>>, AppError> {
    let user_id = user_id_from(&headers);
    let task = state
        .queue
        .submit_single(&user_id, &request.symbol, request.parameters)
        .await?;
    Ok(Json(ApiResponse::success(task)))
}

async fn submit_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchAnalysisRequest>,
) -> Result<Json<ApiResponse<BatchSubmitResponse>>, AppError> {
    let user_id = user_id_from(&headers);
    let (batch, tasks) = state
        .queue
        .submit_batch(&user_id, &request.title, &request.symbols, request.parameters)
        .await?;
    Ok(Json(ApiResponse::success(BatchSubmitResponse {
        batch,
        tasks,
    })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AnalysisTask>>, AppError> {
    let task = state
        .queue
        .get_task(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {id}")))?;
    Ok(Json(ApiResponse::success(task)))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<AnalysisBatch>>, AppError> {
    let batch = state
        .queue
        .get_batch(&id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("batch {id}")))?;
    Ok(Json(ApiResponse::success(batch)))
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub outcome: String,
}

async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<CancelResponse>>, AppError> {
    let user_id = user_id_from(&headers);
    let outcome = state.queue.cancel(&user_id, &id).await?;
    Ok(Json(ApiResponse::success(CancelResponse {
        task_id: id,
        outcome: match outcome {
            analysis_worker::CancelOutcome::Cancelled => "cancelled".to_string(),
            analysis_worker::CancelOutcome::CancelRequested => "cancel-requested".to_string(),
        },
    })))
}
