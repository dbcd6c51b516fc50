pub mod akshare;
pub mod health;
pub mod pacing;
pub mod router;
pub mod tushare;
pub mod yfinance;

pub use akshare::AkshareProvider;
pub use health::{HealthMetrics, HealthMonitor, SourceStatus};
pub use router::{FallbackOutcome, SourceRouter};
pub use tushare::TushareProvider;
pub use yfinance::YfinanceProvider;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::time::Duration;

use market_core::{
    BasicInfo, DailyBar, FinancialRecord, FinancialSnapshot, NewsItem, Period, ProviderError,
    Quote,
};

/// Uniform capability surface over one upstream data source.
///
/// Every adapter implements the same set; a capability the vendor does not
/// offer returns `ProviderError::Unsupported` rather than fabricated data.
/// All results are normalized at this boundary: canonical codes, market cap
/// in 亿元, volume in shares, amounts in yuan.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_all_symbols(&self) -> Result<Vec<BasicInfo>, ProviderError> {
        Err(ProviderError::Unsupported("list_all_symbols"))
    }

    async fn get_basic_info(&self, _code: &str) -> Result<BasicInfo, ProviderError> {
        Err(ProviderError::Unsupported("get_basic_info"))
    }

    async fn get_quote(&self, _code: &str) -> Result<Quote, ProviderError> {
        Err(ProviderError::Unsupported("get_quote"))
    }

    async fn get_quote_batch(
        &self,
        _codes: &[String],
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        Err(ProviderError::Unsupported("get_quote_batch"))
    }

    async fn get_historical_bars(
        &self,
        _code: &str,
        _start: NaiveDate,
        _end: NaiveDate,
        _period: Period,
    ) -> Result<Vec<DailyBar>, ProviderError> {
        Err(ProviderError::Unsupported("get_historical_bars"))
    }

    async fn get_financials(&self, _code: &str) -> Result<Vec<FinancialRecord>, ProviderError> {
        Err(ProviderError::Unsupported("get_financials"))
    }

    async fn get_news(
        &self,
        _code: Option<&str>,
        _limit: usize,
    ) -> Result<Vec<NewsItem>, ProviderError> {
        Err(ProviderError::Unsupported("get_news"))
    }

    async fn latest_trade_date(&self) -> Result<NaiveDate, ProviderError> {
        Err(ProviderError::Unsupported("latest_trade_date"))
    }

    async fn daily_basic_snapshot(
        &self,
        _trade_date: NaiveDate,
    ) -> Result<HashMap<String, FinancialSnapshot>, ProviderError> {
        Err(ProviderError::Unsupported("daily_basic_snapshot"))
    }
}

/// Default per-operation timeout for adapter HTTP calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded in-adapter retry for transport-class failures only:
/// up to 3 attempts with 1 s / 2 s / 4 s backoff.
pub async fn with_transport_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut last_err = None;
    for attempt in 0..3u32 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                let wait = Duration::from_secs(1 << attempt);
                tracing::debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    wait_secs = wait.as_secs(),
                    "[WARN] transient failure, backing off"
                );
                tokio::time::sleep(wait).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| ProviderError::Transient("retries exhausted".to_string())))
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::Transient(e.to_string())
    } else if let Some(status) = e.status() {
        if status.as_u16() == 429 {
            ProviderError::RateLimited(status.to_string())
        } else if status.is_server_error() {
            ProviderError::Transient(status.to_string())
        } else {
            ProviderError::Permanent(status.to_string())
        }
    } else {
        ProviderError::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_transport_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Permanent("bad token".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_passes_straight_through() {
        let result: Result<(), _> =
            with_transport_retry("op", || async { Err(ProviderError::NotFound) }).await;
        assert!(matches!(result, Err(ProviderError::NotFound)));
    }

    #[tokio::test]
    async fn first_success_short_circuits() {
        let calls = AtomicU32::new(0);
        let result = with_transport_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProviderError>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
