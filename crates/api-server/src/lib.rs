//! HTTP/WS surface and dependency wiring.
//!
//! Everything the components need is constructed once in `run_server`
//! and handed down through `AppState`; no module reaches for globals.

mod analysis_routes;
mod notification_routes;
mod stock_data_routes;
mod stock_sync_routes;
mod system_routes;
mod ws_routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use analysis_worker::{StoreBackedEngine, TaskQueue, WorkerPool, WorkerPoolSettings};
use cache_layer::CacheLayer;
use consistency_checker::ConsistencyChecker;
use market_core::config::AppConfig;
use market_core::{ProviderError, QueueError, StoreError};
use market_store::MarketStore;
use notification_service::NotificationBus;
use observability::Metrics;
use provider_gateway::{
    AkshareProvider, HealthMonitor, MarketDataProvider, SourceRouter, TushareProvider,
    YfinanceProvider,
};
use sync_service::{
    BasicsSyncService, FinancialSyncService, HistoricalSyncService, QuoteSyncService, Scheduler,
    SyncDeps,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: MarketStore,
    pub cache: Arc<CacheLayer>,
    pub router: Arc<SourceRouter>,
    pub metrics: Arc<Metrics>,
    pub notifier: Arc<NotificationBus>,
    pub queue: Arc<TaskQueue>,
    pub basics_sync: Arc<BasicsSyncService>,
    pub historical_sync: Arc<HistoricalSyncService>,
    pub financial_sync: Arc<FinancialSyncService>,
    pub quote_sync: Arc<QuoteSyncService>,
}

impl AppState {
    /// Provider names in routed priority order, for store readers that
    /// resolve multi-source records.
    pub fn source_order(&self) -> Vec<String> {
        let mut providers = self.config.providers.clone();
        providers.sort_by_key(|p| p.priority);
        providers
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| p.name)
            .collect()
    }
}

/// Standard response envelope.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Error half of every handler. Carries a stable machine code; messages
/// never include credentials (config keeps only env var names).
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad-request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not-found",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        let status = match &e {
            QueueError::QuotaExceededConcurrent { .. } | QueueError::QuotaExceededDaily { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            QueueError::BadRequest(_) => StatusCode::BAD_REQUEST,
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::Store(_) | QueueError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "store-unavailable",
            message: e.to_string(),
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound => Self::not_found("no provider has this symbol"),
            ProviderError::Unsupported(op) => Self {
                status: StatusCode::BAD_GATEWAY,
                code: "provider-unsupported",
                message: format!("no provider supports {op}"),
            },
            ProviderError::RateLimited(m) => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "provider-rate-limited",
                message: m,
            },
            ProviderError::Transient(m) => Self {
                status: StatusCode::BAD_GATEWAY,
                code: "provider-transient",
                message: m,
            },
            ProviderError::Permanent(m) => Self {
                status: StatusCode::BAD_GATEWAY,
                code: "provider-permanent",
                message: m,
            },
        }
    }
}

/// Identity extraction is a collaborator concern (§ external interfaces);
/// the header carries the already-authenticated principal.
pub fn user_id_from(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("demo")
        .to_string()
}

pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .merge(analysis_routes::routes())
        .merge(stock_data_routes::routes())
        .merge(stock_sync_routes::routes())
        .merge(notification_routes::routes())
        .merge(system_routes::routes())
        .merge(ws_routes::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let config = AppConfig::from_env();
    let offenders = config.validate();
    if !offenders.is_empty() {
        for offender in &offenders {
            tracing::error!("[FAIL] config: {offender}");
        }
        anyhow::bail!("startup validation failed with {} error(s)", offenders.len());
    }
    let config = Arc::new(config);

    let store = MarketStore::new(&config.database_url).await?;
    tracing::info!(url = config.database_url.as_str(), "[OK] store ready");

    let mut cache = CacheLayer::new(config.cache_policies.clone());
    if let Some(redis_url) = &config.redis_url {
        match redis::Client::open(redis_url.as_str()) {
            Ok(client) => match redis::aio::ConnectionManager::new(client).await {
                Ok(connection) => {
                    cache = cache.with_l2(connection);
                    tracing::info!("[OK] L2 cache enabled");
                }
                Err(e) => tracing::warn!(error = %e, "[WARN] L2 cache disabled"),
            },
            Err(e) => tracing::warn!(error = %e, "[WARN] L2 cache disabled"),
        }
    }
    let cache = Arc::new(cache);

    // One adapter instance per provider; pacing and timeouts live inside.
    let mut adapters: HashMap<String, Arc<dyn MarketDataProvider>> = HashMap::new();
    for provider in &config.providers {
        if !provider.enabled {
            continue;
        }
        let adapter: Arc<dyn MarketDataProvider> = match provider.name.as_str() {
            "tushare" => {
                let token = provider
                    .credentials_ref
                    .as_ref()
                    .and_then(|key| std::env::var(key).ok())
                    .unwrap_or_default();
                Arc::new(TushareProvider::new(token))
            }
            "akshare" => Arc::new(AkshareProvider::new(config.akshare_base_url.clone())),
            "yfinance" => Arc::new(YfinanceProvider::new()),
            other => {
                tracing::warn!(provider = other, "[WARN] no adapter for provider, skipping");
                continue;
            }
        };
        adapters.insert(provider.name.clone(), adapter);
    }

    let health = Arc::new(HealthMonitor::new(config.health_monitor.clone()));
    let router = Arc::new(SourceRouter::new(
        config.providers.clone(),
        adapters,
        health.clone(),
    ));
    tokio::spawn(health.clone().run(router.adapters()));

    let metrics = Arc::new(Metrics::new());
    let checker = Arc::new(ConsistencyChecker::default());
    let deps = SyncDeps {
        router: router.clone(),
        store: store.clone(),
        checker,
        metrics: metrics.clone(),
    };
    let basics_sync = Arc::new(BasicsSyncService::new(deps.clone()));
    let historical_sync = Arc::new(HistoricalSyncService::new(deps.clone()));
    let financial_sync = Arc::new(FinancialSyncService::new(deps.clone()));
    let quote_sync = Arc::new(QuoteSyncService::new(deps));

    let scheduler = Arc::new(Scheduler::new(
        config.sync_jobs.clone(),
        basics_sync.clone(),
        historical_sync.clone(),
        financial_sync.clone(),
        quote_sync.clone(),
    ));
    scheduler.spawn();

    let notifier = Arc::new(NotificationBus::new(store.clone()));
    let (queue, queue_rx) = TaskQueue::new(
        store.clone(),
        notifier.clone(),
        config.quotas.clone(),
        config.worker_pool.default_max_retries,
    );
    let queue = Arc::new(queue);

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        cache: cache.clone(),
        router,
        metrics: metrics.clone(),
        notifier: notifier.clone(),
        queue: queue.clone(),
        basics_sync,
        historical_sync,
        financial_sync,
        quote_sync,
    };

    let engine = Arc::new(StoreBackedEngine::new(
        store.clone(),
        cache,
        state.source_order(),
    ));
    let pool = Arc::new(WorkerPool::new(
        store,
        engine,
        notifier,
        metrics,
        queue.cancel_registry(),
        queue.sender(),
        WorkerPoolSettings {
            workers: config.worker_pool.workers,
            ..Default::default()
        },
    ));
    pool.spawn(queue_rx);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = config.bind_addr.as_str(), "[OK] api server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
