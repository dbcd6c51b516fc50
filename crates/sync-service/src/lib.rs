//! Batched, rate-limited, resumable sync jobs over the provider gateway,
//! plus the scheduler that triggers them.
//!
//! Every service follows the same protocol: take the per-job singleton
//! lock (try-lock; a run already in flight wins), mark the persisted
//! status `running`, ask the router for a provider order, walk the
//! symbols in chunks with fallback, persist in batches, and finish with a
//! terminal status plus the list of sources actually used. The lock guard
//! is dropped on every exit path.

pub mod basics;
pub mod financial;
pub mod historical;
pub mod quotes;
pub mod scheduler;

pub use basics::BasicsSyncService;
pub use financial::FinancialSyncService;
pub use historical::{HistoricalSyncOptions, HistoricalSyncService};
pub use quotes::QuoteSyncService;
pub use scheduler::Scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use consistency_checker::ConsistencyChecker;
use market_store::MarketStore;
use observability::Metrics;
use provider_gateway::SourceRouter;

/// Dependencies shared by every sync service; wired once at startup.
#[derive(Clone)]
pub struct SyncDeps {
    pub router: Arc<SourceRouter>,
    pub store: MarketStore,
    pub checker: Arc<ConsistencyChecker>,
    pub metrics: Arc<Metrics>,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("bad-request: {0}")]
    BadRequest(String),
}

/// Cooperative cancel flag checked between batches.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-job singleton lock with try-lock semantics. The owned guard keeps
/// the lock across awaits and releases it on drop, panics included.
#[derive(Clone, Default)]
pub struct JobLock(Arc<Mutex<()>>);

impl JobLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` means another run holds the lock.
    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }

    /// Forced runs queue behind the current one instead of overlapping.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    //! Stub providers and a wired-up dependency container for the sync
    //! service tests.

    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::collections::HashMap;
    use std::sync::Arc;

    use consistency_checker::ConsistencyChecker;
    use market_core::config::{HealthMonitorConfig, ProviderConfig};
    use market_core::{
        BasicInfo, DailyBar, FinancialRecord, FinancialSnapshot, Period, ProviderError,
        ProviderKind, Quote, ReportType,
    };
    use market_store::MarketStore;
    use observability::Metrics;
    use provider_gateway::{HealthMonitor, MarketDataProvider, SourceRouter};

    use crate::SyncDeps;

    pub const STUB_CODES: [&str; 3] = ["600000", "000001", "300750"];

    pub fn stub_trade_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, 5).expect("valid date")
    }

    #[derive(Clone, Default)]
    pub struct StubBehavior {
        /// When set, every call on the `alpha` provider fails transiently.
        pub alpha_fails: bool,
        on_list: Option<Arc<dyn Fn() + Send + Sync>>,
    }

    impl StubBehavior {
        pub fn healthy() -> Self {
            Self::default()
        }

        pub fn primary_down() -> Self {
            Self {
                alpha_fails: true,
                ..Self::default()
            }
        }

        pub fn set_on_list(&mut self, hook: impl Fn() + Send + Sync + 'static) {
            self.on_list = Some(Arc::new(hook));
        }
    }

    struct StubProvider {
        name: &'static str,
        behavior: StubBehavior,
    }

    impl StubProvider {
        fn check_down(&self) -> Result<(), ProviderError> {
            if self.behavior.alpha_fails && self.name == "alpha" {
                Err(ProviderError::Transient("stub provider down".to_string()))
            } else {
                Ok(())
            }
        }

        fn basic_info(&self, code: &str) -> BasicInfo {
            BasicInfo {
                code: code.to_string(),
                full_symbol: market_core::symbols::full_symbol_for(code),
                name: format!("stock {code}"),
                industry: "银行".to_string(),
                area: "上海".to_string(),
                market: "主板".to_string(),
                list_date: "19991110".to_string(),
                source: self.name.to_string(),
                financial_snapshot: None,
                updated_at: Utc::now(),
            }
        }

        fn quote(&self, code: &str, price: f64) -> Quote {
            Quote {
                code: code.to_string(),
                price,
                open: Some(price - 0.1),
                high: Some(price + 0.1),
                low: Some(price - 0.2),
                pre_close: Some(price - 0.05),
                change: Some(0.05),
                change_percent: Some(0.5),
                volume: Some(1_000_000.0),
                amount: Some(1.0e7),
                trade_date: stub_trade_date(),
                source: self.name.to_string(),
                updated_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn list_all_symbols(&self) -> Result<Vec<BasicInfo>, ProviderError> {
            self.check_down()?;
            if let Some(hook) = &self.behavior.on_list {
                hook();
            }
            Ok(STUB_CODES.iter().map(|c| self.basic_info(c)).collect())
        }

        async fn get_basic_info(&self, code: &str) -> Result<BasicInfo, ProviderError> {
            self.check_down()?;
            if STUB_CODES.contains(&code) {
                Ok(self.basic_info(code))
            } else {
                Err(ProviderError::NotFound)
            }
        }

        async fn get_quote(&self, code: &str) -> Result<Quote, ProviderError> {
            self.check_down()?;
            Ok(self.quote(code, 10.0))
        }

        async fn get_quote_batch(
            &self,
            codes: &[String],
        ) -> Result<HashMap<String, Quote>, ProviderError> {
            self.check_down()?;
            let mut out = HashMap::new();
            for (i, code) in STUB_CODES.iter().enumerate() {
                if codes.is_empty() || codes.iter().any(|c| c == code) {
                    out.insert(code.to_string(), self.quote(code, 10.0 + i as f64));
                }
            }
            Ok(out)
        }

        async fn get_historical_bars(
            &self,
            code: &str,
            start: NaiveDate,
            end: NaiveDate,
            period: Period,
        ) -> Result<Vec<DailyBar>, ProviderError> {
            self.check_down()?;
            let all_dates = [
                NaiveDate::from_ymd_opt(2025, 11, 3).expect("valid date"),
                NaiveDate::from_ymd_opt(2025, 11, 4).expect("valid date"),
                stub_trade_date(),
            ];
            Ok(all_dates
                .into_iter()
                .filter(|d| *d >= start && *d <= end)
                .enumerate()
                .map(|(i, trade_date)| DailyBar {
                    code: code.to_string(),
                    source: self.name.to_string(),
                    trade_date,
                    period,
                    open: Some(9.9 + i as f64 * 0.1),
                    high: Some(10.1 + i as f64 * 0.1),
                    low: Some(9.8 + i as f64 * 0.1),
                    close: Some(10.0 + i as f64 * 0.1),
                    volume: Some(1_000_000.0),
                    amount: Some(1.0e7),
                    turnover: Some(1.1),
                    change_percent: Some(0.4),
                })
                .collect())
        }

        async fn get_financials(&self, code: &str) -> Result<Vec<FinancialRecord>, ProviderError> {
            self.check_down()?;
            Ok(vec![
                FinancialRecord {
                    symbol: code.to_string(),
                    report_period: "20250630".to_string(),
                    source: self.name.to_string(),
                    report_type: ReportType::Quarterly,
                    revenue: Some(9.4e9),
                    net_income: Some(1.1e9),
                    eps: Some(0.45),
                    roe: Some(11.2),
                    debt_to_assets: Some(62.0),
                    gross_margin: Some(28.5),
                    statements: None,
                },
                FinancialRecord {
                    symbol: code.to_string(),
                    report_period: "20241231".to_string(),
                    source: self.name.to_string(),
                    report_type: ReportType::Annual,
                    revenue: Some(1.9e10),
                    net_income: Some(2.3e9),
                    eps: Some(0.92),
                    roe: Some(11.8),
                    debt_to_assets: Some(61.0),
                    gross_margin: Some(29.0),
                    statements: None,
                },
            ])
        }

        async fn latest_trade_date(&self) -> Result<NaiveDate, ProviderError> {
            self.check_down()?;
            Ok(stub_trade_date())
        }

        async fn daily_basic_snapshot(
            &self,
            _trade_date: NaiveDate,
        ) -> Result<HashMap<String, FinancialSnapshot>, ProviderError> {
            self.check_down()?;
            Ok(STUB_CODES
                .iter()
                .map(|code| {
                    (
                        code.to_string(),
                        FinancialSnapshot {
                            pe: Some(5.2),
                            pb: Some(0.55),
                            total_mv: Some(820.0),
                            turnover_rate: Some(1.1),
                            volume_ratio: Some(0.9),
                            ..Default::default()
                        },
                    )
                })
                .collect())
        }
    }

    fn provider_config(name: &str, priority: i32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: ProviderKind::CnEquity,
            enabled: true,
            priority,
            credentials_ref: None,
        }
    }

    pub async fn stub_deps(behavior: StubBehavior) -> SyncDeps {
        let store = MarketStore::new("sqlite::memory:")
            .await
            .expect("in-memory store");
        let health = Arc::new(HealthMonitor::new(HealthMonitorConfig {
            tick_secs: 300,
            failure_threshold: 3,
            response_time_threshold_secs: 30,
        }));
        let mut adapters: std::collections::HashMap<String, Arc<dyn MarketDataProvider>> =
            std::collections::HashMap::new();
        adapters.insert(
            "alpha".to_string(),
            Arc::new(StubProvider {
                name: "alpha",
                behavior: behavior.clone(),
            }),
        );
        adapters.insert(
            "beta".to_string(),
            Arc::new(StubProvider {
                name: "beta",
                behavior: StubBehavior::healthy(),
            }),
        );
        let router = SourceRouter::new(
            vec![provider_config("alpha", 1), provider_config("beta", 2)],
            adapters,
            health,
        );
        SyncDeps {
            router: Arc::new(router),
            store,
            checker: Arc::new(ConsistencyChecker::default()),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_lock_is_exclusive_until_dropped() {
        let lock = JobLock::new();
        let guard = lock.try_acquire().expect("first acquire");
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn cancel_flag_latches_until_reset() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!flag.is_cancelled());
    }
}
