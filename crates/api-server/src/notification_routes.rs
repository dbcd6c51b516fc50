//! Notification listing and read-state management.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use market_store::NotificationPage;

use crate::{user_id_from, ApiResponse, AppError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", get(list))
        .route("/api/notifications/unread-count", get(unread_count))
        .route("/api/notifications/:id/read", post(mark_read))
        .route("/api/notifications/read-all", post(mark_all_read))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<NotificationPage>>, AppError> {
    let user_id = user_id_from(&headers);
    if let Some(status) = query.status.as_deref() {
        if !matches!(status, "read" | "unread") {
            return Err(AppError::bad_request("status must be read or unread"));
        }
    }
    if let Some(kind) = query.kind.as_deref() {
        if !matches!(kind, "analysis" | "alert" | "system") {
            return Err(AppError::bad_request(
                "type must be analysis, alert, or system",
            ));
        }
    }
    let page = state
        .notifier
        .list(
            &user_id,
            query.status.as_deref(),
            query.kind.as_deref(),
            query.page.unwrap_or(1),
            query.page_size.unwrap_or(20),
        )
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

async fn unread_count(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let user_id = user_id_from(&headers);
    let count = state.notifier.unread_count(&user_id).await?;
    Ok(Json(ApiResponse::success(json!({"unread": count}))))
}

async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let user_id = user_id_from(&headers);
    if !state.notifier.mark_read(&user_id, &id).await? {
        return Err(AppError::not_found(format!("notification {id}")));
    }
    Ok(Json(ApiResponse::success(json!({"id": id}))))
}

async fn mark_all_read(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let user_id = user_id_from(&headers);
    let changed = state.notifier.mark_all_read(&user_id).await?;
    Ok(Json(ApiResponse::success(json!({"marked": changed}))))
}
