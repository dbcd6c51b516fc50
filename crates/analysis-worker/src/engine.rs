//! The analysis-engine seam.
//!
//! Workers drive any `AnalysisEngine` through its analyst phases, checking
//! the cancel flag between phases and reporting per-phase progress. LLM
//! collaborators implement this trait; `StoreBackedEngine` is the shipped
//! implementation that assembles its phase reports from persisted data so
//! the pipeline runs end-to-end without an external model.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use cache_layer::CacheLayer;
use market_core::{AnalysisOutcome, AnalysisParameters, AnalysisTask, Period};
use market_store::MarketStore;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Worth re-enqueueing: upstream timeout, LLM rate limit, transient
    /// provider trouble.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Terminal for this task.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Output of one analyst phase.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: String,
    pub output: Value,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Analyst phases for this submission, in execution order.
    fn phases(&self, parameters: &AnalysisParameters) -> Vec<String>;

    async fn run_phase(
        &self,
        phase: &str,
        task: &AnalysisTask,
    ) -> Result<PhaseReport, EngineError>;

    /// Combine the phase reports into the final outcome.
    async fn synthesize(
        &self,
        task: &AnalysisTask,
        reports: &[PhaseReport],
    ) -> Result<AnalysisOutcome, EngineError>;
}

/// Phase-structured engine over the persisted market data. Reads go
/// through the cache layer with the `market_data` policy.
pub struct StoreBackedEngine {
    store: MarketStore,
    cache: Arc<CacheLayer>,
    source_order: Vec<String>,
}

impl StoreBackedEngine {
    pub fn new(store: MarketStore, cache: Arc<CacheLayer>, source_order: Vec<String>) -> Self {
        Self {
            store,
            cache,
            source_order,
        }
    }

    async fn market_report(&self, symbol: &str) -> Result<Value, EngineError> {
        let params = json!({"op": "market", "symbol": symbol});
        if let Some(cached) = self.cache.get("market_data", &params).await {
            return Ok(cached);
        }

        let quote = self
            .store
            .get_quote(symbol)
            .await
            .map_err(|e| EngineError::Retryable(e.to_string()))?;
        let end = Utc::now().date_naive();
        let bars = self
            .store
            .list_bars(symbol, Period::Daily, end - ChronoDuration::days(90), end, None)
            .await
            .map_err(|e| EngineError::Retryable(e.to_string()))?;

        let closes: Vec<f64> = bars.iter().filter_map(|b| b.close).collect();
        let trend = match (closes.first(), closes.last()) {
            (Some(first), Some(last)) if *first != 0.0 => (last - first) / first * 100.0,
            _ => 0.0,
        };
        let report = json!({
            "price": quote.as_ref().map(|q| q.price),
            "trade_date": quote.as_ref().map(|q| q.trade_date.to_string()),
            "bars_analyzed": bars.len(),
            "trend_percent": trend,
        });
        self.cache.put("market_data", &params, report.clone()).await;
        Ok(report)
    }

    async fn fundamentals_report(&self, symbol: &str) -> Result<Value, EngineError> {
        let records = self
            .store
            .list_financials(symbol, None, 4)
            .await
            .map_err(|e| EngineError::Retryable(e.to_string()))?;
        let latest = records.first();
        Ok(json!({
            "report_periods": records.len(),
            "latest_period": latest.map(|r| r.report_period.clone()),
            "revenue": latest.and_then(|r| r.revenue),
            "net_income": latest.and_then(|r| r.net_income),
            "roe": latest.and_then(|r| r.roe),
        }))
    }

    async fn profile_report(&self, symbol: &str) -> Result<Value, EngineError> {
        let info = self
            .store
            .get_basic_info(symbol, &self.source_order)
            .await
            .map_err(|e| EngineError::Retryable(e.to_string()))?;
        Ok(json!({
            "name": info.as_ref().map(|i| i.name.clone()),
            "industry": info.as_ref().map(|i| i.industry.clone()),
            "pe": info
                .as_ref()
                .and_then(|i| i.financial_snapshot.as_ref())
                .and_then(|s| s.pe),
        }))
    }
}

#[async_trait]
impl AnalysisEngine for StoreBackedEngine {
    fn phases(&self, parameters: &AnalysisParameters) -> Vec<String> {
        if parameters.selected_analysts.is_empty() {
            vec!["market".to_string()]
        } else {
            parameters.selected_analysts.clone()
        }
    }

    async fn run_phase(
        &self,
        phase: &str,
        task: &AnalysisTask,
    ) -> Result<PhaseReport, EngineError> {
        let output = match phase {
            "market" => self.market_report(&task.symbol).await?,
            "fundamentals" => self.fundamentals_report(&task.symbol).await?,
            _ => self.profile_report(&task.symbol).await?,
        };
        Ok(PhaseReport {
            phase: phase.to_string(),
            output,
            tokens_in: 0,
            tokens_out: 0,
        })
    }

    async fn synthesize(
        &self,
        task: &AnalysisTask,
        reports: &[PhaseReport],
    ) -> Result<AnalysisOutcome, EngineError> {
        let trend = reports
            .iter()
            .find(|r| r.phase == "market")
            .and_then(|r| r.output.get("trend_percent"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let recommendation = if trend > 5.0 {
            "buy"
        } else if trend < -5.0 {
            "sell"
        } else {
            "hold"
        };

        let detailed: Value = json!(reports
            .iter()
            .map(|r| (r.phase.clone(), r.output.clone()))
            .collect::<std::collections::HashMap<_, _>>());

        Ok(AnalysisOutcome {
            summary: Some(format!(
                "{}: {} analyst phases over stored data",
                task.symbol,
                reports.len()
            )),
            recommendation: Some(recommendation.to_string()),
            confidence_score: Some(0.5 + (trend.abs().min(20.0) / 100.0)),
            risk_level: Some(if trend.abs() > 10.0 { "high" } else { "medium" }.to_string()),
            key_points: reports.iter().map(|r| r.phase.clone()).collect(),
            detailed_analysis: Some(detailed),
            tokens_used: reports.iter().map(|r| r.tokens_in + r.tokens_out).sum(),
            execution_time_secs: 0.0,
            model_info: Some("store-backed".to_string()),
        })
    }
}
