//! Stock basics sync: one primary list call, valuation snapshot merge,
//! cross-source reconciliation, batched upserts keyed `(code, source)`.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use market_core::{
    BasicInfo, FinancialSnapshot, ProviderKind, SyncState, SyncStatus,
};
use market_store::with_store_retry;

use crate::{CancelFlag, JobLock, SyncDeps};

const JOB: &str = "stock_basics";
const DATA_TYPE: &str = "basic_info";
const BATCH_SIZE: usize = 500;
/// Bound on concurrent per-symbol enrichment calls.
const ENRICH_CONCURRENCY: usize = 8;
/// Sample size for the cross-source consistency comparison.
const CONSISTENCY_SAMPLE: usize = 100;

pub struct BasicsSyncService {
    deps: SyncDeps,
    lock: JobLock,
    cancel: CancelFlag,
}

impl BasicsSyncService {
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

    /// Full-market sync, or a targeted sync when `symbols` is given.
    pub async fn run(&self, force: bool, symbols: Option<Vec<String>>) -> SyncStatus {
        let _guard = match self.lock.try_acquire() {
            Some(guard) => guard,
            None if !force => {
                tracing::info!(job = JOB, "sync already running; returning current status");
                return self.status().await;
            }
            None => self.lock.acquire().await,
        };
        self.cancel.reset();

        let mut status = SyncStatus::idle(JOB, DATA_TYPE);
        status.status = SyncState::Running;
        status.started_at = Some(Utc::now());
        let _ = self.deps.store.persist_sync_status(&status).await;

        match self.run_inner(&mut status, symbols).await {
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
            "[OK] basics sync finished"
        );
        status
    }

    async fn run_inner(
        &self,
        status: &mut SyncStatus,
        symbols: Option<Vec<String>>,
    ) -> Result<(), String> {
        let deps = &self.deps;

        // Step 1: stock list, with fallback across providers.
        let mut records = match &symbols {
            Some(symbols) => self.fetch_targeted(symbols, status).await?,
            None => {
                let outcome = deps
                    .metrics
                    .observe("sync.basics.list", async {
                        deps.router
                            .call_with_fallback(
                                ProviderKind::CnEquity,
                                false,
                                "list_all_symbols",
                                |p| async move { p.list_all_symbols().await },
                            )
                            .await
                    })
                    .await
                    .map_err(|e| format!("all providers failed to list symbols: {e}"))?;
                status
                    .data_sources_used
                    .push(format!("stock_list:{}", outcome.source));
                outcome.value
            }
        };
        status.total = records.len() as i64;

        // Step 2: latest trade date and the primary valuation snapshot.
        let trade_date = deps
            .router
            .call_with_fallback(ProviderKind::CnEquity, false, "latest_trade_date", |p| {
                async move { p.latest_trade_date().await }
            })
            .await
            .ok()
            .map(|o| o.value);

        let mut snapshot: HashMap<String, FinancialSnapshot> = HashMap::new();
        if let Some(trade_date) = trade_date {
            match deps
                .router
                .call_with_fallback(
                    ProviderKind::CnEquity,
                    false,
                    "daily_basic_snapshot",
                    move |p| async move { p.daily_basic_snapshot(trade_date).await },
                )
                .await
            {
                Ok(outcome) => {
                    status
                        .data_sources_used
                        .push(format!("daily_data:{}", outcome.source));
                    let primary_source = outcome.source.clone();
                    snapshot = outcome.value;
                    self.reconcile_against_secondary(&snapshot, &primary_source, trade_date, status)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "[WARN] no valuation snapshot available");
                }
            }
        }

        // Step 3: merge snapshot metrics into the records.
        for record in &mut records {
            if let Some(snap) = snapshot.get(&record.code) {
                record.financial_snapshot = Some(snap.clone());
            }
        }

        // Step 4: batched persistence with cancellation between batches.
        for chunk in records.chunks(BATCH_SIZE) {
            if self.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            match with_store_retry("basics.upsert", || {
                deps.store.upsert_basic_info_batch(chunk)
            })
            .await
            {
                Ok(batch) => {
                    status.inserted += batch.inserted as i64;
                    status.updated += batch.updated as i64;
                    status.errors += batch.errors as i64;
                }
                Err(e) => {
                    tracing::error!(error = %e, "[FAIL] basics batch lost after retries");
                    status.errors += chunk.len() as i64;
                }
            }
            let _ = deps.store.persist_sync_status(status).await;
        }
        Ok(())
    }

    /// Targeted enrichment: per-symbol basic-info calls bounded to
    /// `ENRICH_CONCURRENCY` concurrent adapter invocations.
    async fn fetch_targeted(
        &self,
        symbols: &[String],
        status: &mut SyncStatus,
    ) -> Result<Vec<BasicInfo>, String> {
        let semaphore = Arc::new(Semaphore::new(ENRICH_CONCURRENCY));
        let mut handles = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let symbol = symbol.clone();
            let router = self.deps.router.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let code = symbol.clone();
                router
                    .call_with_fallback(ProviderKind::CnEquity, false, "get_basic_info", move |p| {
                        let code = code.clone();
                        async move { p.get_basic_info(&code).await }
                    })
                    .await
                    .ok()
            }));
        }

        let mut records = Vec::new();
        let mut sources_seen = std::collections::BTreeSet::new();
        let mut errors = 0i64;
        for handle in handles {
            match handle.await {
                Ok(Some(outcome)) => {
                    sources_seen.insert(outcome.source.clone());
                    records.push(outcome.value);
                }
                _ => errors += 1,
            }
        }
        status.errors += errors;
        for source in sources_seen {
            status.data_sources_used.push(format!("basic_info:{source}"));
        }
        if records.is_empty() {
            return Err("no symbols could be fetched".to_string());
        }
        Ok(records)
    }

    /// Compare the primary snapshot against the next provider in the
    /// route. The directive only decides logging and the status message;
    /// the primary is what gets persisted either way.
    async fn reconcile_against_secondary(
        &self,
        primary: &HashMap<String, FinancialSnapshot>,
        primary_source: &str,
        trade_date: chrono::NaiveDate,
        status: &mut SyncStatus,
    ) {
        let order = self.deps.router.route(ProviderKind::CnEquity, false).await;
        let secondary_name = match order.iter().find(|name| *name != primary_source) {
            Some(name) => name.clone(),
            None => return,
        };
        let secondary_adapter = match self.deps.router.adapter(&secondary_name) {
            Some(adapter) => adapter,
            None => return,
        };
        let secondary = match secondary_adapter.daily_basic_snapshot(trade_date).await {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };

        // Average the overlap sample per side, then compare the averages.
        let common: Vec<&String> = primary
            .keys()
            .filter(|code| secondary.contains_key(*code))
            .take(CONSISTENCY_SAMPLE)
            .collect();
        if common.is_empty() {
            return;
        }
        let primary_avg = average_snapshot(common.iter().map(|c| &primary[*c]));
        let secondary_avg = average_snapshot(common.iter().map(|c| &secondary[*c]));

        let report = self.deps.checker.check_snapshot(
            &primary_avg,
            &secondary_avg,
            primary_source,
            &secondary_name,
        );
        status.message = Some(format!(
            "consistency {primary_source} vs {secondary_name}: score {:.2}, {:?}",
            report.confidence_score, report.directive
        ));
    }
}

fn average_snapshot<'a>(snaps: impl Iterator<Item = &'a FinancialSnapshot>) -> FinancialSnapshot {
    let mut sums: [(f64, u32); 5] = [(0.0, 0); 5];
    for snap in snaps {
        for (slot, value) in [
            snap.pe,
            snap.pb,
            snap.total_mv,
            snap.turnover_rate,
            snap.volume_ratio,
        ]
        .iter()
        .enumerate()
        {
            if let Some(v) = value {
                sums[slot].0 += v;
                sums[slot].1 += 1;
            }
        }
    }
    let avg = |slot: usize| -> Option<f64> {
        let (sum, n) = sums[slot];
        if n > 0 {
            Some(sum / n as f64)
        } else {
            None
        }
    };
    FinancialSnapshot {
        pe: avg(0),
        pb: avg(1),
        total_mv: avg(2),
        turnover_rate: avg(3),
        volume_ratio: avg(4),
        ..Default::default()
    }
}
