//! Multi-period historical bar sync.
//!
//! Walks per-source and per-period, inserting with the composite key
//! `(code, source, trade_date, period)`. Re-running a window is
//! idempotent; with `incremental` only rows newer than the stored maximum
//! are fetched.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};

use market_core::{Period, ProviderKind, SyncState, SyncStatus};
use market_store::with_store_retry;

use crate::{CancelFlag, JobLock, SyncDeps, SyncError};

const JOB: &str = "historical_bars";
const DATA_TYPE: &str = "historical";
const CHUNK_SIZE: usize = 50;
const FULL_HISTORY_START: (i32, u32, u32) = (1990, 1, 1);

#[derive(Debug, Clone)]
pub struct HistoricalSyncOptions {
    /// None enumerates every code known to the basics store.
    pub symbols: Option<Vec<String>>,
    pub periods: Vec<Period>,
    /// None walks the routed provider order.
    pub sources: Option<Vec<String>>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    /// Since 1990-01-01, overriding the window.
    pub all_history: bool,
    /// Resume from the newest stored trade date per series.
    pub incremental: bool,
    pub force: bool,
}

impl Default for HistoricalSyncOptions {
    fn default() -> Self {
        Self {
            symbols: None,
            periods: Period::all().to_vec(),
            sources: None,
            start: None,
            end: None,
            all_history: false,
            incremental: true,
            force: false,
        }
    }
}

pub struct HistoricalSyncService {
    deps: SyncDeps,
    lock: JobLock,
    cancel: CancelFlag,
}

impl HistoricalSyncService {
    pub fn new(deps: SyncDeps) -> Self {
        Self {
            deps,
            lock: JobLock::new(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn status(&self) -> SyncStatus {
        self.deps
            .store
            .get_sync_status(JOB, DATA_TYPE)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| SyncStatus::idle(JOB, DATA_TYPE))
    }

    pub async fn run(&self, options: HistoricalSyncOptions) -> Result<SyncStatus, SyncError> {
        let (start, end) = Self::resolve_window(&options)?;

        let _guard = match self.lock.try_acquire() {
            Some(guard) => guard,
            None if !options.force => {
                tracing::info!(job = JOB, "sync already running; returning current status");
                return Ok(self.status().await);
            }
            None => self.lock.acquire().await,
        };
        self.cancel.reset();

        let mut status = SyncStatus::idle(JOB, DATA_TYPE);
        status.status = SyncState::Running;
        status.started_at = Some(Utc::now());
        let _ = self.deps.store.persist_sync_status(&status).await;

        match self.run_inner(&options, start, end, &mut status).await {
            Ok(()) => {
                status.status = if status.errors == 0 {
                    SyncState::Success
                } else {
                    SyncState::SuccessWithErrors
                };
            }
            Err(message) => {
                status.status = SyncState::Failed;
                status.message = Some(message);
            }
        }
        status.finished_at = Some(Utc::now());
        let _ = self.deps.store.persist_sync_status(&status).await;
        tracing::info!(
            job = JOB,
            status = status.status.as_str(),
            total = status.total,
            inserted = status.inserted,
            updated = status.updated,
            errors = status.errors,
            "[OK] historical sync finished"
        );
        Ok(status)
    }

    fn resolve_window(
        options: &HistoricalSyncOptions,
    ) -> Result<(NaiveDate, NaiveDate), SyncError> {
        let end = options.end.unwrap_or_else(|| Utc::now().date_naive());
        let start = if options.all_history {
            NaiveDate::from_ymd_opt(
                FULL_HISTORY_START.0,
                FULL_HISTORY_START.1,
                FULL_HISTORY_START.2,
            )
            .unwrap_or(end)
        } else {
            options
                .start
                .unwrap_or_else(|| end - ChronoDuration::days(365))
        };
        if start > end {
            return Err(SyncError::BadRequest(format!(
                "window start {start} is after end {end}"
            )));
        }
        Ok((start, end))
    }

    async fn run_inner(
        &self,
        options: &HistoricalSyncOptions,
        start: NaiveDate,
        end: NaiveDate,
        status: &mut SyncStatus,
    ) -> Result<(), String> {
        let deps = &self.deps;

        let symbols = match &options.symbols {
            Some(symbols) if !symbols.is_empty() => symbols.clone(),
            _ => deps
                .store
                .all_codes()
                .await
                .map_err(|e| format!("cannot enumerate symbols: {e}"))?,
        };
        if symbols.is_empty() {
            return Err("no symbols to sync; run the basics sync first".to_string());
        }

        let sources = match &options.sources {
            Some(sources) if !sources.is_empty() => sources.clone(),
            _ => deps.router.route(ProviderKind::CnEquity, false).await,
        };
        if sources.is_empty() {
            return Err("no providers available".to_string());
        }

        status.total = (symbols.len() * sources.len() * options.periods.len()) as i64;

        for source in &sources {
            let adapter = match deps.router.adapter(source) {
                Some(adapter) => adapter,
                None => {
                    tracing::warn!(source = source.as_str(), "[WARN] unknown provider, skipping");
                    continue;
                }
            };
            let mut used = false;

            for period in &options.periods {
                for chunk in symbols.chunks(CHUNK_SIZE) {
                    if self.cancel.is_cancelled() {
                        return Err("cancelled".to_string());
                    }
                    for code in chunk {
                        let fetch_start = if options.incremental {
                            match deps.store.max_bar_trade_date(code, source, *period).await {
                                Ok(Some(max_stored)) => {
                                    let next = max_stored + ChronoDuration::days(1);
                                    if next > end {
                                        // Series already current.
                                        continue;
                                    }
                                    next.max(start)
                                }
                                _ => start,
                            }
                        } else {
                            start
                        };

                        let bars = match adapter
                            .get_historical_bars(code, fetch_start, end, *period)
                            .await
                        {
                            Ok(bars) => bars,
                            Err(e) if e.counts_as_failure() => {
                                deps.router.health().record_failure(
                                    source,
                                    &e.to_string(),
                                    std::time::Duration::ZERO,
                                );
                                status.errors += 1;
                                continue;
                            }
                            Err(_) => continue,
                        };
                        if bars.is_empty() {
                            continue;
                        }
                        used = true;

                        match with_store_retry("historical.upsert", || {
                            deps.store.upsert_bars_batch(&bars)
                        })
                        .await
                        {
                            Ok(batch) => {
                                status.inserted += batch.inserted as i64;
                                status.updated += batch.updated as i64;
                                status.errors += batch.errors as i64;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "[FAIL] bar batch lost after retries");
                                status.errors += bars.len() as i64;
                            }
                        }

                        // Project the newest daily close into the quote
                        // store, but never over a fresher realtime quote.
                        if *period == Period::Daily {
                            self.project_latest_bar(code, source).await;
                        }
                    }
                    let _ = deps.store.persist_sync_status(status).await;
                }
            }
            if used {
                status.data_sources_used.push(source.clone());
            }
        }
        Ok(())
    }

    async fn project_latest_bar(&self, code: &str, source: &str) {
        let store = &self.deps.store;
        let latest = match store.latest_bar(code, source, Period::Daily).await {
            Ok(Some(bar)) => bar,
            _ => return,
        };
        let close = match latest.close {
            Some(close) => close,
            None => return,
        };
        let quote = market_core::Quote {
            code: latest.code.clone(),
            price: close,
            open: latest.open,
            high: latest.high,
            low: latest.low,
            pre_close: None,
            change: None,
            change_percent: latest.change_percent,
            volume: latest.volume,
            amount: latest.amount,
            trade_date: latest.trade_date,
            source: source.to_string(),
            updated_at: Utc::now(),
        };
        // StaleSkipped is the expected outcome when realtime is ahead.
        if let Err(e) = store.project_quote_if_newer(&quote).await {
            tracing::warn!(code, error = %e, "[WARN] quote projection failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{stub_deps, stub_trade_date, StubBehavior, STUB_CODES};
    use market_core::Quote;

    fn options(symbols: &[&str]) -> HistoricalSyncOptions {
        HistoricalSyncOptions {
            symbols: Some(symbols.iter().map(|s| s.to_string()).collect()),
            periods: vec![Period::Daily],
            sources: Some(vec!["alpha".to_string()]),
            start: NaiveDate::from_ymd_opt(2025, 11, 1),
            end: Some(stub_trade_date()),
            all_history: false,
            incremental: false,
            force: false,
        }
    }

    #[tokio::test]
    async fn window_sync_inserts_composite_keyed_rows() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let service = HistoricalSyncService::new(deps.clone());

        let status = service.run(options(&["600000"])).await.unwrap();
        assert_eq!(status.status, SyncState::Success);
        // Three stub sessions in the window.
        assert_eq!(status.inserted, 3);
        assert_eq!(status.data_sources_used, vec!["alpha"]);
        assert_eq!(
            deps.store.count_bars("600000", Period::Daily).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn rerunning_same_window_yields_same_row_set() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let service = HistoricalSyncService::new(deps.clone());

        service.run(options(&["600000"])).await.unwrap();
        let second = service.run(options(&["600000"])).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 3);
        assert_eq!(
            deps.store.count_bars("600000", Period::Daily).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn incremental_rerun_skips_current_series() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let service = HistoricalSyncService::new(deps.clone());

        service.run(options(&["600000"])).await.unwrap();

        let mut incremental = options(&["600000"]);
        incremental.incremental = true;
        let status = service.run(incremental).await.unwrap();
        // Stored max is the window end: nothing newer to write.
        assert_eq!(status.inserted, 0);
        assert_eq!(status.updated, 0);
        assert_eq!(status.status, SyncState::Success);
    }

    #[tokio::test]
    async fn inverted_window_is_bad_request() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let service = HistoricalSyncService::new(deps);
        let mut bad = options(&["600000"]);
        bad.start = NaiveDate::from_ymd_opt(2025, 11, 10);
        bad.end = NaiveDate::from_ymd_opt(2025, 11, 1);
        let err = service.run(bad).await.unwrap_err();
        assert!(matches!(err, SyncError::BadRequest(_)));
    }

    #[tokio::test]
    async fn latest_bar_projects_into_quote_store() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let service = HistoricalSyncService::new(deps.clone());
        service.run(options(&["600000"])).await.unwrap();

        let quote = deps.store.get_quote("600000").await.unwrap().unwrap();
        assert_eq!(quote.trade_date, stub_trade_date());
        // The stub's newest bar closes at 10.2.
        assert!((quote.price - 10.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn projection_never_regresses_a_newer_quote() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        // Seed a realtime quote one day ahead of the stub bars.
        let newer = Quote {
            code: "600000".to_string(),
            price: 11.5,
            open: None,
            high: None,
            low: None,
            pre_close: None,
            change: None,
            change_percent: None,
            volume: None,
            amount: None,
            trade_date: stub_trade_date() + ChronoDuration::days(1),
            source: "akshare".to_string(),
            updated_at: Utc::now(),
        };
        deps.store.upsert_quote(&newer).await.unwrap();

        let service = HistoricalSyncService::new(deps.clone());
        service.run(options(&["600000"])).await.unwrap();

        let quote = deps.store.get_quote("600000").await.unwrap().unwrap();
        assert_eq!(quote.price, 11.5);
        assert_eq!(quote.trade_date, stub_trade_date() + ChronoDuration::days(1));
    }

    #[tokio::test]
    async fn enumerates_store_when_no_symbols_given() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        // Seed the basics store so enumeration finds the stub codes.
        let basics = crate::BasicsSyncService::new(deps.clone());
        basics.run(false, None).await;

        let service = HistoricalSyncService::new(deps.clone());
        let mut opts = options(&[]);
        opts.symbols = None;
        let status = service.run(opts).await.unwrap();
        assert_eq!(status.status, SyncState::Success);
        for code in STUB_CODES {
            assert!(deps.store.count_bars(code, Period::Daily).await.unwrap() > 0);
        }
    }
}
