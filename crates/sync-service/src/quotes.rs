//! Realtime quote sync.
//!
//! Full-market runs prefer one snapshot call over N single-symbol calls;
//! single-symbol sync goes through the router so an adapter without a
//! per-symbol realtime endpoint simply falls through to one that has it.

use chrono::Utc;

use market_core::{ProviderError, ProviderKind, Quote, SyncState, SyncStatus};
use market_store::with_store_retry;

use crate::{CancelFlag, JobLock, SyncDeps};

const JOB: &str = "market_quotes";
const DATA_TYPE: &str = "quotes";
const BATCH_SIZE: usize = 500;

pub struct QuoteSyncService {
    deps: SyncDeps,
    lock: JobLock,
    cancel: CancelFlag,
}

impl QuoteSyncService {
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

    /// Full-market sync via one snapshot call, or a targeted subset.
    pub async fn run(&self, force: bool, codes: Vec<String>) -> SyncStatus {
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

        match self.run_inner(&mut status, codes).await {
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
            "[OK] quote sync finished"
        );
        status
    }

    async fn run_inner(&self, status: &mut SyncStatus, codes: Vec<String>) -> Result<(), String> {
        let deps = &self.deps;

        let wanted = codes.clone();
        let outcome = deps
            .metrics
            .observe("sync.quotes.snapshot", async {
                deps.router
                    .call_with_fallback(ProviderKind::CnEquity, false, "get_quote_batch", move |p| {
                        let wanted = wanted.clone();
                        async move { p.get_quote_batch(&wanted).await }
                    })
                    .await
            })
            .await
            .map_err(|e| format!("all providers failed the market snapshot: {e}"))?;

        status
            .data_sources_used
            .push(format!("quotes:{}", outcome.source));
        let quotes: Vec<Quote> = outcome.value.into_values().collect();
        status.total = quotes.len() as i64;

        for chunk in quotes.chunks(BATCH_SIZE) {
            if self.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
            match with_store_retry("quotes.upsert", || deps.store.upsert_quote_batch(chunk)).await {
                Ok(batch) => {
                    status.inserted += batch.inserted as i64;
                    status.updated += batch.updated as i64;
                    status.errors += batch.errors as i64;
                    // Stale same-code rewrites are no-ops, not failures.
                    if batch.skipped > 0 {
                        tracing::debug!(skipped = batch.skipped, "stale quotes skipped");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "[FAIL] quote batch lost after retries");
                    status.errors += chunk.len() as i64;
                }
            }
            let _ = deps.store.persist_sync_status(status).await;
        }
        Ok(())
    }

    /// Single-symbol sync through the fallback chain. Returns the stored
    /// quote and the provider that served it.
    pub async fn sync_single(&self, code: &str) -> Result<(Quote, String), ProviderError> {
        let deps = &self.deps;
        let symbol = code.to_string();
        let outcome = deps
            .router
            .call_with_fallback(ProviderKind::CnEquity, false, "get_quote", move |p| {
                let symbol = symbol.clone();
                async move { p.get_quote(&symbol).await }
            })
            .await?;

        let quote = outcome.value;
        if let Err(e) = deps.store.upsert_quote(&quote).await {
            tracing::warn!(code, error = %e, "[WARN] single quote persist failed");
        }
        Ok((quote, outcome.source))
    }
}
