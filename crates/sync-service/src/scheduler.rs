//! Interval scheduler for the sync jobs.
//!
//! One loop per configured job. Overlap is impossible by construction:
//! each trigger goes through the service's own singleton try-lock, so a
//! tick that lands while the previous run is still going is a no-op.
//! The quote job is additionally gated on exchange trading hours.

use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use market_core::calendar;
use market_core::config::SyncJobConfig;

use crate::{
    BasicsSyncService, FinancialSyncService, HistoricalSyncOptions, HistoricalSyncService,
    QuoteSyncService,
};

pub struct Scheduler {
    jobs: Vec<SyncJobConfig>,
    basics: Arc<BasicsSyncService>,
    historical: Arc<HistoricalSyncService>,
    financial: Arc<FinancialSyncService>,
    quotes: Arc<QuoteSyncService>,
}

impl Scheduler {
    pub fn new(
        jobs: Vec<SyncJobConfig>,
        basics: Arc<BasicsSyncService>,
        historical: Arc<HistoricalSyncService>,
        financial: Arc<FinancialSyncService>,
        quotes: Arc<QuoteSyncService>,
    ) -> Self {
        Self {
            jobs,
            basics,
            historical,
            financial,
            quotes,
        }
    }

    /// Spawn one background loop per job; handles are returned so the
    /// host can abort them on shutdown.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for job in self.jobs.clone() {
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(job.interval_secs));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it so startup is
                // not a thundering herd of syncs.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    scheduler.trigger(&job, false).await;
                }
            }));
        }
        tracing::info!(jobs = handles.len(), "[OK] scheduler started");
        handles
    }

    /// Fire one job. Returns false when the trigger was suppressed
    /// (market closed and not forced).
    pub async fn trigger(&self, job: &SyncJobConfig, force: bool) -> bool {
        if job.market_hours_only && !force && !calendar::in_trading_hours(Utc::now()) {
            tracing::debug!(job = job.name.as_str(), "trigger skipped outside market hours");
            return false;
        }

        tracing::info!(job = job.name.as_str(), "scheduler trigger");
        match job.data_class.as_str() {
            "basic_info" => {
                self.basics.run(force, None).await;
            }
            "historical" => {
                let options = HistoricalSyncOptions {
                    force,
                    ..Default::default()
                };
                if let Err(e) = self.historical.run(options).await {
                    tracing::warn!(job = job.name.as_str(), error = %e, "[WARN] trigger rejected");
                }
            }
            "financial" => {
                self.financial.run(force, None).await;
            }
            "quotes" => {
                self.quotes.run(force, Vec::new()).await;
            }
            other => {
                tracing::warn!(data_class = other, "[WARN] unknown sync data class");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{stub_deps, StubBehavior};
    use crate::SyncDeps;
    use market_core::SyncState;

    fn scheduler_for(deps: SyncDeps, jobs: Vec<SyncJobConfig>) -> Scheduler {
        Scheduler::new(
            jobs,
            Arc::new(BasicsSyncService::new(deps.clone())),
            Arc::new(HistoricalSyncService::new(deps.clone())),
            Arc::new(FinancialSyncService::new(deps.clone())),
            Arc::new(QuoteSyncService::new(deps)),
        )
    }

    fn job(name: &str, data_class: &str, market_hours_only: bool) -> SyncJobConfig {
        SyncJobConfig {
            name: name.to_string(),
            data_class: data_class.to_string(),
            interval_secs: 3600,
            chunk_size: 500,
            timeout_secs: 60,
            market_hours_only,
        }
    }

    #[tokio::test]
    async fn basics_trigger_runs_the_sync() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let scheduler = scheduler_for(deps.clone(), Vec::new());
        let ran = scheduler
            .trigger(&job("stock_basics", "basic_info", false), false)
            .await;
        assert!(ran);
        let status = deps
            .store
            .get_sync_status("stock_basics", "basic_info")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, SyncState::Success);
    }

    #[tokio::test]
    async fn forced_quote_trigger_ignores_market_hours() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let scheduler = scheduler_for(deps.clone(), Vec::new());
        // force=true bypasses the calendar gate no matter the wall clock.
        let ran = scheduler
            .trigger(&job("market_quotes", "quotes", true), true)
            .await;
        assert!(ran);
        assert!(deps.store.get_quote("600000").await.unwrap().is_some());
    }
}
