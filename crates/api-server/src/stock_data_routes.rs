//! Read paths over the persisted market data. Hot lookups go through the
//! cache layer with a miss-through back into it.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use market_core::symbols::canonicalize_code;

use crate::{ApiResponse, AppError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/stock-data/basic-info/:symbol", get(basic_info))
        .route("/api/stock-data/quotes/:symbol", get(quote))
        .route("/api/stock-data/list", get(list))
        .route("/api/stock-data/search", get(search))
        .route("/api/stock-data/combined/:symbol", get(combined))
        .route("/api/stock-data/markets", get(markets))
        .route("/api/stock-data/sync-status/quotes", get(quote_sync_status))
}

async fn basic_info(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let params = json!({"op": "basic_info", "symbol": canonicalize_code(&symbol)});
    if let Some(cached) = state.cache.get("stock_info", &params).await {
        return Ok(Json(ApiResponse::success(cached)));
    }

    let info = state
        .store
        .get_basic_info(&symbol, &state.source_order())
        .await?
        .ok_or_else(|| AppError::not_found(format!("no basic info for {symbol}")))?;
    let value = serde_json::to_value(&info).map_err(|e| AppError::internal(e.to_string()))?;
    state.cache.put("stock_info", &params, value.clone()).await;
    Ok(Json(ApiResponse::success(value)))
}

async fn quote(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let params = json!({"op": "quote", "symbol": canonicalize_code(&symbol)});
    if let Some(cached) = state.cache.get("stock_quotes", &params).await {
        return Ok(Json(ApiResponse::success(cached)));
    }

    let quote = state
        .store
        .get_quote(&symbol)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no quote for {symbol}")))?;
    let value = serde_json::to_value(&quote).map_err(|e| AppError::internal(e.to_string()))?;
    state
        .cache
        .put("stock_quotes", &params, value.clone())
        .await;
    Ok(Json(ApiResponse::success(value)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub page_size: Option<i64>,
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50).clamp(1, 200);
    let records = state
        .store
        .list_basic_info(&state.source_order(), page_size, (page - 1) * page_size)
        .await?;
    Ok(Json(ApiResponse::success(json!({
        "items": records,
        "page": page,
        "page_size": page_size,
    }))))
}

#[derive(Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    if query.keyword.trim().is_empty() {
        return Err(AppError::bad_request("keyword is required"));
    }
    let records = state
        .store
        .search_basic_info(&query.keyword, query.limit.unwrap_or(20).clamp(1, 100))
        .await?;
    Ok(Json(ApiResponse::success(json!({"items": records}))))
}

/// Basic info, latest quote, and recent financials in one payload.
async fn combined(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let source_order = state.source_order();
    let info = state.store.get_basic_info(&symbol, &source_order).await?;
    let quote = state.store.get_quote(&symbol).await?;
    let financials = state.store.list_financials(&symbol, None, 4).await?;
    if info.is_none() && quote.is_none() && financials.is_empty() {
        return Err(AppError::not_found(format!("nothing stored for {symbol}")));
    }
    Ok(Json(ApiResponse::success(json!({
        "basic_info": info,
        "quote": quote,
        "financials": financials,
    }))))
}

async fn markets(State(state): State<AppState>) -> Json<ApiResponse<Value>> {
    let providers: Vec<Value> = state
        .config
        .providers
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "kind": p.kind.as_str(),
                "enabled": p.enabled,
                "priority": p.priority,
            })
        })
        .collect();
    Json(ApiResponse::success(json!({
        "markets": ["cn", "hk", "us"],
        "providers": providers,
    })))
}

async fn quote_sync_status(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let status = state.quote_sync.status().await;
    let latest = state.store.latest_quote_trade_date().await?;
    Ok(Json(ApiResponse::success(json!({
        "status": status,
        "latest_trade_date": latest.map(|d| d.to_string()),
    }))))
}
