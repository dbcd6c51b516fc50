//! Financial statement sync: one document per report period, fetched with
//! provider fallback and persisted with history preserved.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Semaphore;

use market_core::{ProviderKind, SyncState, SyncStatus};
use market_store::with_store_retry;

use crate::{CancelFlag, JobLock, SyncDeps};

const JOB: &str = "financials";
const DATA_TYPE: &str = "financial";
const CHUNK_SIZE: usize = 50;
const FETCH_CONCURRENCY: usize = 8;

pub struct FinancialSyncService {
    deps: SyncDeps,
    lock: JobLock,
    cancel: CancelFlag,
}

impl FinancialSyncService {
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
            "[OK] financial sync finished"
        );
        status
    }

    async fn run_inner(
        &self,
        status: &mut SyncStatus,
        symbols: Option<Vec<String>>,
    ) -> Result<(), String> {
        let deps = &self.deps;
        let symbols = match symbols {
            Some(symbols) if !symbols.is_empty() => symbols,
            _ => deps
                .store
                .all_codes()
                .await
                .map_err(|e| format!("cannot enumerate symbols: {e}"))?,
        };
        if symbols.is_empty() {
            return Err("no symbols to sync; run the basics sync first".to_string());
        }
        status.total = symbols.len() as i64;

        let mut sources_seen = std::collections::BTreeSet::new();
        for chunk in symbols.chunks(CHUNK_SIZE) {
            if self.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }

            let semaphore = Arc::new(Semaphore::new(FETCH_CONCURRENCY));
            let mut handles = Vec::with_capacity(chunk.len());
            for code in chunk {
                let code = code.clone();
                let router = deps.router.clone();
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    let symbol = code.clone();
                    router
                        .call_with_fallback(
                            ProviderKind::CnEquity,
                            false,
                            "get_financials",
                            move |p| {
                                let symbol = symbol.clone();
                                async move { p.get_financials(&symbol).await }
                            },
                        )
                        .await
                        .ok()
                }));
            }

            let mut records = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok(Some(outcome)) => {
                        sources_seen.insert(outcome.source.clone());
                        records.extend(outcome.value);
                    }
                    _ => status.errors += 1,
                }
            }

            if !records.is_empty() {
                match with_store_retry("financial.upsert", || {
                    deps.store.upsert_financials_batch(&records)
                })
                .await
                {
                    Ok(batch) => {
                        status.inserted += batch.inserted as i64;
                        status.updated += batch.updated as i64;
                        status.errors += batch.errors as i64;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "[FAIL] financial batch lost after retries");
                        status.errors += records.len() as i64;
                    }
                }
            }
            let _ = deps.store.persist_sync_status(status).await;
        }

        for source in sources_seen {
            status.data_sources_used.push(source);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::{stub_deps, StubBehavior};

    #[tokio::test]
    async fn each_report_period_persists_separately() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let service = FinancialSyncService::new(deps.clone());

        let status = service
            .run(false, Some(vec!["600000".to_string()]))
            .await;
        assert_eq!(status.status, SyncState::Success);
        // Two report periods per symbol in the stub.
        assert_eq!(status.inserted, 2);
        assert_eq!(status.data_sources_used, vec!["alpha"]);

        let records = deps
            .store
            .list_financials("600000", None, 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].report_period, "20250630");
    }

    #[tokio::test]
    async fn resync_preserves_history() {
        let deps = stub_deps(StubBehavior::healthy()).await;
        let service = FinancialSyncService::new(deps.clone());
        service.run(false, Some(vec!["600000".to_string()])).await;
        let second = service.run(false, Some(vec!["600000".to_string()])).await;
        assert_eq!(second.updated, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(
            deps.store
                .list_financials("600000", None, 10)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn primary_outage_falls_back_per_symbol() {
        let deps = stub_deps(StubBehavior::primary_down()).await;
        let service = FinancialSyncService::new(deps.clone());
        let status = service.run(false, Some(vec!["600000".to_string()])).await;
        assert_eq!(status.status, SyncState::Success);
        assert_eq!(status.data_sources_used, vec!["beta"]);
    }
}
