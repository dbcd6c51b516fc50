//! Tushare Pro adapter (api.tushare.pro JSON POST protocol).
//!
//! Realtime single-symbol quotes are not part of the vendor's contract;
//! `get_quote` reports `Unsupported` and the router falls through to a
//! provider that serves it. Batch quotes are derived from the latest
//! full-market daily table.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use market_core::symbols::{canonicalize_code, code_from_suffixed, full_symbol_for, lots_to_shares, wan_to_yi};
use market_core::{
    BasicInfo, DailyBar, FinancialRecord, FinancialSnapshot, Period, ProviderError, Quote,
    ReportType,
};

use crate::pacing::SlidingWindowLimiter;
use crate::{map_reqwest_error, with_transport_retry, MarketDataProvider, DEFAULT_TIMEOUT};

const BASE_URL: &str = "https://api.tushare.pro";

#[derive(Deserialize)]
struct ApiResponse {
    code: i64,
    msg: Option<String>,
    data: Option<ApiData>,
}

#[derive(Deserialize)]
struct ApiData {
    fields: Vec<String>,
    items: Vec<Vec<serde_json::Value>>,
}

/// Column-indexed view over one tushare result table.
struct Table {
    index: HashMap<String, usize>,
    items: Vec<Vec<serde_json::Value>>,
}

impl Table {
    fn new(data: ApiData) -> Self {
        let index = data
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i))
            .collect();
        Self {
            index,
            items: data.items,
        }
    }

    fn str_at(&self, row: &[serde_json::Value], field: &str) -> Option<String> {
        let idx = *self.index.get(field)?;
        match row.get(idx)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn f64_at(&self, row: &[serde_json::Value], field: &str) -> Option<f64> {
        let idx = *self.index.get(field)?;
        match row.get(idx)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

pub struct TushareProvider {
    token: String,
    client: Client,
    limiter: SlidingWindowLimiter,
}

impl TushareProvider {
    pub fn new(token: String) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        // Pro tier allows ~500 calls/min; free accounts should lower this
        // via TUSHARE_RATE_LIMIT.
        let rate_limit: usize = std::env::var("TUSHARE_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        Self {
            token,
            client,
            limiter: SlidingWindowLimiter::new(rate_limit, Duration::from_secs(60)),
        }
    }

    /// Exchange-suffixed form tushare expects (`.SH`, not the canonical `.SS`).
    fn ts_code_for(code: &str) -> String {
        let canonical = full_symbol_for(code);
        match canonical.rsplit_once('.') {
            Some((bare, "SS")) => format!("{bare}.SH"),
            _ => canonical,
        }
    }

    async fn call(
        &self,
        api_name: &str,
        params: serde_json::Value,
        fields: &str,
    ) -> Result<Table, ProviderError> {
        self.limiter.acquire().await;

        let body = json!({
            "api_name": api_name,
            "token": self.token,
            "params": params,
            "fields": fields,
        });

        let response = self
            .client
            .post(BASE_URL)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(if status.as_u16() == 429 {
                ProviderError::RateLimited(format!("tushare HTTP {status}"))
            } else if status.is_server_error() {
                ProviderError::Transient(format!("tushare HTTP {status}"))
            } else {
                ProviderError::Permanent(format!("tushare HTTP {status}"))
            });
        }

        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("tushare decode: {e}")))?;

        if api.code != 0 {
            let msg = api.msg.unwrap_or_default();
            return Err(if msg.contains("每分钟") || msg.contains("频率") {
                ProviderError::RateLimited(msg)
            } else {
                // Credit/permission problems do not heal with retries.
                ProviderError::Permanent(msg)
            });
        }

        let data = api
            .data
            .ok_or_else(|| ProviderError::Transient("tushare: empty data envelope".to_string()))?;
        Ok(Table::new(data))
    }

    fn parse_trade_date(raw: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(raw, "%Y%m%d").ok()
    }

    fn bar_api_for(period: Period) -> &'static str {
        match period {
            Period::Daily => "daily",
            Period::Weekly => "weekly",
            Period::Monthly => "monthly",
        }
    }
}

#[async_trait]
impl MarketDataProvider for TushareProvider {
    fn name(&self) -> &'static str {
        "tushare"
    }

    async fn list_all_symbols(&self) -> Result<Vec<BasicInfo>, ProviderError> {
        let table = with_transport_retry("tushare.stock_basic", || {
            self.call(
                "stock_basic",
                json!({"list_status": "L"}),
                "ts_code,symbol,name,area,industry,market,list_date",
            )
        })
        .await?;

        let now = Utc::now();
        let mut out = Vec::with_capacity(table.items.len());
        for row in &table.items {
            let ts_code = table.str_at(row, "ts_code").unwrap_or_default();
            let code = if ts_code.is_empty() {
                canonicalize_code(&table.str_at(row, "symbol").unwrap_or_default())
            } else {
                code_from_suffixed(&ts_code)
            };
            if code.is_empty() {
                continue;
            }
            out.push(BasicInfo {
                full_symbol: full_symbol_for(&code),
                code,
                name: table.str_at(row, "name").unwrap_or_default(),
                industry: table.str_at(row, "industry").unwrap_or_default(),
                area: table.str_at(row, "area").unwrap_or_default(),
                market: table.str_at(row, "market").unwrap_or_default(),
                list_date: table.str_at(row, "list_date").unwrap_or_default(),
                source: "tushare".to_string(),
                financial_snapshot: None,
                updated_at: now,
            });
        }
        if out.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(out)
    }

    async fn get_basic_info(&self, code: &str) -> Result<BasicInfo, ProviderError> {
        let ts_code = Self::ts_code_for(code);
        let table = with_transport_retry("tushare.stock_basic_one", || {
            self.call(
                "stock_basic",
                json!({"ts_code": ts_code}),
                "ts_code,symbol,name,area,industry,market,list_date",
            )
        })
        .await?;

        let row = table.items.first().ok_or(ProviderError::NotFound)?;
        let code = canonicalize_code(code);
        Ok(BasicInfo {
            full_symbol: full_symbol_for(&code),
            code,
            name: table.str_at(row, "name").unwrap_or_default(),
            industry: table.str_at(row, "industry").unwrap_or_default(),
            area: table.str_at(row, "area").unwrap_or_default(),
            market: table.str_at(row, "market").unwrap_or_default(),
            list_date: table.str_at(row, "list_date").unwrap_or_default(),
            source: "tushare".to_string(),
            financial_snapshot: None,
            updated_at: Utc::now(),
        })
    }

    // Vendor contract: realtime is full-market only.

    async fn get_quote_batch(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        let trade_date = self.latest_trade_date().await?;
        let date_str = trade_date.format("%Y%m%d").to_string();

        let table = with_transport_retry("tushare.daily_all", || {
            self.call(
                "daily",
                json!({"trade_date": date_str}),
                "ts_code,trade_date,open,high,low,close,pre_close,change,pct_chg,vol,amount",
            )
        })
        .await?;

        let wanted: Option<std::collections::HashSet<&str>> = if codes.is_empty() {
            None
        } else {
            Some(codes.iter().map(|c| c.as_str()).collect())
        };

        let now = Utc::now();
        let mut out = HashMap::new();
        for row in &table.items {
            let ts_code = match table.str_at(row, "ts_code") {
                Some(c) => c,
                None => continue,
            };
            let code = code_from_suffixed(&ts_code);
            if let Some(wanted) = &wanted {
                if !wanted.contains(code.as_str()) {
                    continue;
                }
            }
            let close = match table.f64_at(row, "close") {
                Some(c) => c,
                None => continue,
            };
            out.insert(
                code.clone(),
                Quote {
                    code,
                    price: close,
                    open: table.f64_at(row, "open"),
                    high: table.f64_at(row, "high"),
                    low: table.f64_at(row, "low"),
                    pre_close: table.f64_at(row, "pre_close"),
                    change: table.f64_at(row, "change"),
                    change_percent: table.f64_at(row, "pct_chg"),
                    // vol is 手, amount is 千元.
                    volume: table.f64_at(row, "vol").map(lots_to_shares),
                    amount: table.f64_at(row, "amount").map(|a| a * 1000.0),
                    trade_date,
                    source: "tushare".to_string(),
                    updated_at: now,
                },
            );
        }
        if out.is_empty() {
            return Err(ProviderError::NotFound);
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
        let ts_code = Self::ts_code_for(code);
        let params = json!({
            "ts_code": ts_code,
            "start_date": start.format("%Y%m%d").to_string(),
            "end_date": end.format("%Y%m%d").to_string(),
        });

        let api = Self::bar_api_for(period);
        let table = with_transport_retry("tushare.bars", || {
            self.call(
                api,
                params.clone(),
                "ts_code,trade_date,open,high,low,close,pct_chg,vol,amount",
            )
        })
        .await?;

        let code = canonicalize_code(code);
        let mut bars = Vec::with_capacity(table.items.len());
        for row in &table.items {
            let trade_date = match table
                .str_at(row, "trade_date")
                .as_deref()
                .and_then(Self::parse_trade_date)
            {
                Some(d) => d,
                None => continue,
            };
            bars.push(DailyBar {
                code: code.clone(),
                source: "tushare".to_string(),
                trade_date,
                period,
                open: table.f64_at(row, "open"),
                high: table.f64_at(row, "high"),
                low: table.f64_at(row, "low"),
                close: table.f64_at(row, "close"),
                volume: table.f64_at(row, "vol").map(lots_to_shares),
                amount: table.f64_at(row, "amount").map(|a| a * 1000.0),
                turnover: None,
                change_percent: table.f64_at(row, "pct_chg"),
            });
        }
        // Tushare returns newest-first; callers expect chronological order.
        bars.sort_by_key(|b| b.trade_date);
        Ok(bars)
    }

    async fn get_financials(&self, code: &str) -> Result<Vec<FinancialRecord>, ProviderError> {
        let ts_code = Self::ts_code_for(code);

        let income = with_transport_retry("tushare.income", || {
            self.call(
                "income",
                json!({"ts_code": ts_code}),
                "end_date,total_revenue,n_income,basic_eps",
            )
        })
        .await?;

        let indicators = with_transport_retry("tushare.fina_indicator", || {
            self.call(
                "fina_indicator",
                json!({"ts_code": ts_code}),
                "end_date,roe,debt_to_assets,grossprofit_margin",
            )
        })
        .await?;

        let mut by_period: HashMap<String, FinancialRecord> = HashMap::new();
        let symbol = canonicalize_code(code);

        for row in &income.items {
            let period = match income.str_at(row, "end_date") {
                Some(p) if !p.is_empty() => p,
                _ => continue,
            };
            let report_type = if period.ends_with("1231") {
                ReportType::Annual
            } else {
                ReportType::Quarterly
            };
            by_period
                .entry(period.clone())
                .or_insert_with(|| FinancialRecord {
                    symbol: symbol.clone(),
                    report_period: period,
                    source: "tushare".to_string(),
                    report_type,
                    revenue: None,
                    net_income: None,
                    eps: None,
                    roe: None,
                    debt_to_assets: None,
                    gross_margin: None,
                    statements: None,
                });
        }

        for row in &income.items {
            if let Some(period) = income.str_at(row, "end_date") {
                if let Some(rec) = by_period.get_mut(&period) {
                    rec.revenue = income.f64_at(row, "total_revenue");
                    rec.net_income = income.f64_at(row, "n_income");
                    rec.eps = income.f64_at(row, "basic_eps");
                }
            }
        }
        for row in &indicators.items {
            if let Some(period) = indicators.str_at(row, "end_date") {
                if let Some(rec) = by_period.get_mut(&period) {
                    rec.roe = indicators.f64_at(row, "roe");
                    rec.debt_to_assets = indicators.f64_at(row, "debt_to_assets");
                    rec.gross_margin = indicators.f64_at(row, "grossprofit_margin");
                }
            }
        }

        if by_period.is_empty() {
            return Err(ProviderError::NotFound);
        }
        let mut records: Vec<FinancialRecord> = by_period.into_values().collect();
        records.sort_by(|a, b| b.report_period.cmp(&a.report_period));
        Ok(records)
    }

    async fn latest_trade_date(&self) -> Result<NaiveDate, ProviderError> {
        let today = Utc::now().date_naive();
        let start = today - ChronoDuration::days(14);
        let table = with_transport_retry("tushare.trade_cal", || {
            self.call(
                "trade_cal",
                json!({
                    "exchange": "SSE",
                    "start_date": start.format("%Y%m%d").to_string(),
                    "end_date": today.format("%Y%m%d").to_string(),
                    "is_open": "1",
                }),
                "cal_date,is_open",
            )
        })
        .await?;

        table
            .items
            .iter()
            .filter_map(|row| {
                table
                    .str_at(row, "cal_date")
                    .as_deref()
                    .and_then(Self::parse_trade_date)
            })
            .max()
            .ok_or(ProviderError::NotFound)
    }

    async fn daily_basic_snapshot(
        &self,
        trade_date: NaiveDate,
    ) -> Result<HashMap<String, FinancialSnapshot>, ProviderError> {
        let date_str = trade_date.format("%Y%m%d").to_string();
        let table = with_transport_retry("tushare.daily_basic", || {
            self.call(
                "daily_basic",
                json!({"trade_date": date_str}),
                "ts_code,pe,pe_ttm,pb,ps,total_mv,circ_mv,turnover_rate,volume_ratio,total_share,float_share",
            )
        })
        .await?;

        let mut out = HashMap::new();
        for row in &table.items {
            let ts_code = match table.str_at(row, "ts_code") {
                Some(c) => c,
                None => continue,
            };
            let code = code_from_suffixed(&ts_code);
            out.insert(
                code,
                FinancialSnapshot {
                    pe: table.f64_at(row, "pe"),
                    pb: table.f64_at(row, "pb"),
                    ps: table.f64_at(row, "ps"),
                    pe_ttm: table.f64_at(row, "pe_ttm"),
                    pb_mrq: table.f64_at(row, "pb"),
                    // Vendor unit is 万元.
                    total_mv: table.f64_at(row, "total_mv").map(wan_to_yi),
                    circ_mv: table.f64_at(row, "circ_mv").map(wan_to_yi),
                    roe: None,
                    turnover_rate: table.f64_at(row, "turnover_rate"),
                    volume_ratio: table.f64_at(row, "volume_ratio"),
                    total_share: table.f64_at(row, "total_share"),
                    float_share: table.f64_at(row, "float_share"),
                },
            );
        }
        if out.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_code_uses_vendor_suffix() {
        assert_eq!(TushareProvider::ts_code_for("600000"), "600000.SH");
        assert_eq!(TushareProvider::ts_code_for("000001"), "000001.SZ");
        assert_eq!(TushareProvider::ts_code_for("830799"), "830799.BJ");
    }

    #[test]
    fn table_reads_by_field_name() {
        let table = Table::new(ApiData {
            fields: vec!["ts_code".to_string(), "close".to_string()],
            items: vec![vec![json!("600000.SH"), json!(10.5)]],
        });
        let row = &table.items[0];
        assert_eq!(table.str_at(row, "ts_code").as_deref(), Some("600000.SH"));
        assert_eq!(table.f64_at(row, "close"), Some(10.5));
        assert_eq!(table.f64_at(row, "missing"), None);
    }

    #[tokio::test]
    async fn single_symbol_realtime_is_unsupported() {
        let provider = TushareProvider::new("test-token".to_string());
        let err = provider.get_quote("600000").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }
}
