use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Valuation metrics attached to a stock's basic record.
/// Market caps are in 亿元 (100M yuan); shares in 万股 as vendors report them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialSnapshot {
    pub pe: Option<f64>,
    pub pb: Option<f64>,
    pub ps: Option<f64>,
    pub pe_ttm: Option<f64>,
    pub pb_mrq: Option<f64>,
    pub total_mv: Option<f64>,
    pub circ_mv: Option<f64>,
    pub roe: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub volume_ratio: Option<f64>,
    pub total_share: Option<f64>,
    pub float_share: Option<f64>,
}

impl FinancialSnapshot {
    pub fn is_empty(&self) -> bool {
        self.pe.is_none()
            && self.pb.is_none()
            && self.total_mv.is_none()
            && self.circ_mv.is_none()
            && self.turnover_rate.is_none()
    }
}

/// Basic listing information for one stock as seen by one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicInfo {
    /// 6-char canonical symbol (zero-padded for CN).
    pub code: String,
    /// Exchange-suffixed form (`.SS`/`.SZ`/`.BJ`/`.HK` or empty).
    pub full_symbol: String,
    pub name: String,
    pub industry: String,
    pub area: String,
    pub market: String,
    pub list_date: String,
    pub source: String,
    pub financial_snapshot: Option<FinancialSnapshot>,
    pub updated_at: DateTime<Utc>,
}

/// Latest realtime quote for one stock. Volume in shares, amount in yuan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub code: String,
    pub price: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub pre_close: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<f64>,
    pub amount: Option<f64>,
    /// Exchange-local calendar date the quote belongs to.
    pub trade_date: NaiveDate,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

/// Bar aggregation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Period> {
        match s {
            "daily" => Some(Period::Daily),
            "weekly" => Some(Period::Weekly),
            "monthly" => Some(Period::Monthly),
            _ => None,
        }
    }

    pub fn all() -> [Period; 3] {
        [Period::Daily, Period::Weekly, Period::Monthly]
    }
}

/// One OHLCV bar keyed by `(code, source, trade_date, period)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    pub code: String,
    pub source: String,
    /// Exchange-local date.
    pub trade_date: NaiveDate,
    pub period: Period,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub amount: Option<f64>,
    pub turnover: Option<f64>,
    pub change_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Quarterly,
    Annual,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Quarterly => "quarterly",
            ReportType::Annual => "annual",
        }
    }
}

/// One financial statement document keyed by `(symbol, report_period, source)`.
/// `report_period` is the fiscal period-end date as YYYYMMDD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialRecord {
    pub symbol: String,
    pub report_period: String,
    pub source: String,
    pub report_type: ReportType,
    pub revenue: Option<f64>,
    pub net_income: Option<f64>,
    pub eps: Option<f64>,
    pub roe: Option<f64>,
    pub debt_to_assets: Option<f64>,
    pub gross_margin: Option<f64>,
    /// Raw nested statements as the vendor returned them.
    pub statements: Option<serde_json::Value>,
}

/// A news article associated with zero or more symbols. Read-through only,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    pub symbols: Vec<String>,
}

/// Capability class of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    CnEquity,
    HkEquity,
    UsEquity,
    News,
    Financial,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::CnEquity => "cn-equity",
            ProviderKind::HkEquity => "hk-equity",
            ProviderKind::UsEquity => "us-equity",
            ProviderKind::News => "news",
            ProviderKind::Financial => "financial",
        }
    }
}

/// Terminal and in-flight states of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Running,
    Success,
    SuccessWithErrors,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Running => "running",
            SyncState::Success => "success",
            SyncState::SuccessWithErrors => "success_with_errors",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<SyncState> {
        match s {
            "idle" => Some(SyncState::Idle),
            "running" => Some(SyncState::Running),
            "success" => Some(SyncState::Success),
            "success_with_errors" => Some(SyncState::SuccessWithErrors),
            "failed" => Some(SyncState::Failed),
            _ => None,
        }
    }
}

/// Persisted status of one sync job, keyed by `(job, data_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub job: String,
    pub data_type: String,
    pub status: SyncState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total: i64,
    pub inserted: i64,
    pub updated: i64,
    pub errors: i64,
    pub data_sources_used: Vec<String>,
    pub message: Option<String>,
}

impl SyncStatus {
    pub fn idle(job: &str, data_type: &str) -> Self {
        Self {
            job: job.to_string(),
            data_type: data_type.to_string(),
            status: SyncState::Idle,
            started_at: None,
            finished_at: None,
            total: 0,
            inserted: 0,
            updated: 0,
            errors: 0,
            data_sources_used: Vec::new(),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_round_trips_through_str() {
        for p in Period::all() {
            assert_eq!(Period::parse(p.as_str()), Some(p));
        }
        assert_eq!(Period::parse("hourly"), None);
    }

    #[test]
    fn sync_state_round_trips_through_str() {
        for s in [
            SyncState::Idle,
            SyncState::Running,
            SyncState::Success,
            SyncState::SuccessWithErrors,
            SyncState::Failed,
        ] {
            assert_eq!(SyncState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn empty_snapshot_detected() {
        assert!(FinancialSnapshot::default().is_empty());
        let snap = FinancialSnapshot {
            pe: Some(12.5),
            ..Default::default()
        };
        assert!(!snap.is_empty());
    }
}
