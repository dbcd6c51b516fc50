//! Operator-facing sync triggers and per-symbol sync status.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use market_core::Period;
use sync_service::{HistoricalSyncOptions, SyncError};

use crate::{ApiResponse, AppError, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/stock-sync/single", post(sync_single))
        .route("/api/stock-sync/batch", post(sync_batch))
        .route("/api/stock-sync/status/:symbol", get(sync_status))
}

#[derive(Deserialize)]
pub struct SingleSyncRequest {
    pub symbol: String,
    /// Also pull the historical window for this symbol.
    #[serde(default)]
    pub include_history: bool,
}

async fn sync_single(
    State(state): State<AppState>,
    Json(request): Json<SingleSyncRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let symbol = request.symbol.trim().to_string();
    if symbol.is_empty() {
        return Err(AppError::bad_request("symbol is required"));
    }

    let (quote, source) = state.quote_sync.sync_single(&symbol).await?;
    let basics = state
        .basics_sync
        .run(false, Some(vec![symbol.clone()]))
        .await;

    let history = if request.include_history {
        let options = HistoricalSyncOptions {
            symbols: Some(vec![symbol.clone()]),
            periods: vec![Period::Daily],
            incremental: true,
            ..Default::default()
        };
        Some(map_sync_result(state.historical_sync.run(options).await)?)
    } else {
        None
    };

    Ok(Json(ApiResponse::success(json!({
        "symbol": symbol,
        "quote_source": source,
        "quote": quote,
        "basics": basics,
        "history": history,
    }))))
}

#[derive(Deserialize)]
pub struct BatchSyncRequest {
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default)]
    pub data_class: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub all_history: bool,
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
    #[serde(default)]
    pub incremental: Option<bool>,
}

async fn sync_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchSyncRequest>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let status = match request.data_class.as_deref().unwrap_or("basic_info") {
        "basic_info" => state.basics_sync.run(request.force, request.symbols).await,
        "quotes" => {
            state
                .quote_sync
                .run(request.force, request.symbols.unwrap_or_default())
                .await
        }
        "financial" => {
            state
                .financial_sync
                .run(request.force, request.symbols)
                .await
        }
        "historical" => {
            let options = HistoricalSyncOptions {
                symbols: request.symbols,
                start: request.start,
                end: request.end,
                all_history: request.all_history,
                incremental: request.incremental.unwrap_or(true),
                force: request.force,
                ..Default::default()
            };
            map_sync_result(state.historical_sync.run(options).await)?
        }
        other => {
            return Err(AppError::bad_request(format!(
                "unknown data_class {other}"
            )))
        }
    };
    Ok(Json(ApiResponse::success(
        serde_json::to_value(&status).map_err(|e| AppError::internal(e.to_string()))?,
    )))
}

async fn sync_status(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let mut per_period = serde_json::Map::new();
    for period in Period::all() {
        let count = state.store.count_bars(&symbol, period).await?;
        per_period.insert(period.as_str().to_string(), json!(count));
    }
    let quote = state.store.get_quote(&symbol).await?;
    let info = state
        .store
        .get_basic_info(&symbol, &state.source_order())
        .await?;
    Ok(Json(ApiResponse::success(json!({
        "symbol": symbol,
        "bars": per_period,
        "has_quote": quote.is_some(),
        "quote_trade_date": quote.map(|q| q.trade_date.to_string()),
        "has_basic_info": info.is_some(),
    }))))
}

fn map_sync_result(
    result: Result<market_core::SyncStatus, SyncError>,
) -> Result<market_core::SyncStatus, AppError> {
    result.map_err(|e| match e {
        SyncError::BadRequest(message) => AppError::bad_request(message),
    })
}
