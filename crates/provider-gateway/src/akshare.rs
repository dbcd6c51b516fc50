//! AKShare adapter, speaking the aktools-style HTTP gateway
//! (`GET {base}/api/public/{endpoint}?args`). The gateway front-ends the
//! EastMoney/Sina feeds, which throttle aggressively per host; the pacer
//! keeps at least 500 ms between consecutive requests.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use market_core::symbols::{canonicalize_code, full_symbol_for, lots_to_shares, yuan_to_yi};
use market_core::{
    BasicInfo, DailyBar, FinancialSnapshot, NewsItem, Period, ProviderError, Quote,
};

use crate::pacing::MinIntervalPacer;
use crate::{map_reqwest_error, with_transport_retry, MarketDataProvider, DEFAULT_TIMEOUT};

pub struct AkshareProvider {
    base_url: String,
    client: Client,
    pacer: MinIntervalPacer,
}

impl AkshareProvider {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            pacer: MinIntervalPacer::new(Duration::from_millis(500)),
        }
    }

    async fn call(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>, ProviderError> {
        self.pacer.acquire().await;

        let url = format!("{}/api/public/{endpoint}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(if status.as_u16() == 429 {
                ProviderError::RateLimited(format!("akshare HTTP {status}"))
            } else if status.is_server_error() {
                ProviderError::Transient(format!("akshare HTTP {status}"))
            } else if status.as_u16() == 404 {
                ProviderError::Unsupported("endpoint not exposed by gateway")
            } else {
                ProviderError::Permanent(format!("akshare HTTP {status}"))
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("akshare decode: {e}")))?;

        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(ProviderError::Transient(format!(
                "akshare: expected array, got {}",
                kind_of(&other)
            ))),
        }
    }

    fn f64_field(row: &Value, name: &str) -> Option<f64> {
        match row.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    fn str_field(row: &Value, name: &str) -> Option<String> {
        match row.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn date_field(row: &Value, name: &str) -> Option<NaiveDate> {
        let raw = Self::str_field(row, name)?;
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(&raw, "%Y%m%d"))
            .ok()
    }

    fn quote_from_spot_row(row: &Value, trade_date: NaiveDate, now: DateTime<Utc>) -> Option<Quote> {
        let code = canonicalize_code(&Self::str_field(row, "代码")?);
        let price = Self::f64_field(row, "最新价")?;
        Some(Quote {
            code,
            price,
            open: Self::f64_field(row, "今开"),
            high: Self::f64_field(row, "最高"),
            low: Self::f64_field(row, "最低"),
            pre_close: Self::f64_field(row, "昨收"),
            change: Self::f64_field(row, "涨跌额"),
            change_percent: Self::f64_field(row, "涨跌幅"),
            volume: Self::f64_field(row, "成交量").map(lots_to_shares),
            amount: Self::f64_field(row, "成交额"),
            trade_date,
            source: "akshare".to_string(),
            updated_at: now,
        })
    }

    /// Trading date the current spot snapshot belongs to: today when the
    /// exchange has opened, otherwise the previous session is close enough
    /// for reconciliation purposes.
    fn spot_trade_date() -> NaiveDate {
        Utc::now().date_naive()
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl MarketDataProvider for AkshareProvider {
    fn name(&self) -> &'static str {
        "akshare"
    }

    async fn list_all_symbols(&self) -> Result<Vec<BasicInfo>, ProviderError> {
        let rows = with_transport_retry("akshare.stock_info_a_code_name", || {
            self.call("stock_info_a_code_name", &[])
        })
        .await?;

        let now = Utc::now();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let code = match Self::str_field(row, "code") {
                Some(c) => canonicalize_code(&c),
                None => continue,
            };
            out.push(BasicInfo {
                full_symbol: full_symbol_for(&code),
                code,
                name: Self::str_field(row, "name").unwrap_or_default(),
                industry: String::new(),
                area: String::new(),
                market: String::new(),
                list_date: String::new(),
                source: "akshare".to_string(),
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
        let code = canonicalize_code(code);
        let params = [("symbol", code.clone())];
        let rows = with_transport_retry("akshare.stock_individual_info_em", || {
            self.call("stock_individual_info_em", &params)
        })
        .await?;

        if rows.is_empty() {
            return Err(ProviderError::NotFound);
        }

        // The endpoint returns item/value pairs rather than one record.
        let mut kv: HashMap<String, String> = HashMap::new();
        for row in &rows {
            if let (Some(item), Some(value)) =
                (Self::str_field(row, "item"), Self::str_field(row, "value"))
            {
                kv.insert(item, value);
            }
        }

        Ok(BasicInfo {
            full_symbol: full_symbol_for(&code),
            code,
            name: kv.get("股票简称").cloned().unwrap_or_default(),
            industry: kv.get("行业").cloned().unwrap_or_default(),
            area: String::new(),
            market: String::new(),
            list_date: kv.get("上市时间").cloned().unwrap_or_default(),
            source: "akshare".to_string(),
            financial_snapshot: None,
            updated_at: Utc::now(),
        })
    }

    async fn get_quote(&self, code: &str) -> Result<Quote, ProviderError> {
        let code = canonicalize_code(code);
        let params = [("symbol", code.clone())];
        let rows = with_transport_retry("akshare.stock_bid_ask_em", || {
            self.call("stock_bid_ask_em", &params)
        })
        .await?;

        if rows.is_empty() {
            return Err(ProviderError::NotFound);
        }

        // item/value pairs again.
        let mut kv: HashMap<String, f64> = HashMap::new();
        for row in &rows {
            if let (Some(item), Some(value)) =
                (Self::str_field(row, "item"), Self::f64_field(row, "value"))
            {
                kv.insert(item, value);
            }
        }

        let price = *kv.get("最新").ok_or(ProviderError::NotFound)?;
        Ok(Quote {
            code,
            price,
            open: kv.get("今开").copied(),
            high: kv.get("最高").copied(),
            low: kv.get("最低").copied(),
            pre_close: kv.get("昨收").copied(),
            change: kv.get("涨跌").copied(),
            change_percent: kv.get("涨幅").copied(),
            volume: kv.get("总手").copied().map(lots_to_shares),
            amount: kv.get("金额").copied(),
            trade_date: Self::spot_trade_date(),
            source: "akshare".to_string(),
            updated_at: Utc::now(),
        })
    }

    async fn get_quote_batch(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        // One full-market snapshot, filtered locally; far cheaper than N
        // single-symbol calls against a throttled host.
        let rows = with_transport_retry("akshare.stock_zh_a_spot_em", || {
            self.call("stock_zh_a_spot_em", &[])
        })
        .await?;

        let wanted: Option<std::collections::HashSet<&str>> = if codes.is_empty() {
            None
        } else {
            Some(codes.iter().map(|c| c.as_str()).collect())
        };

        let trade_date = Self::spot_trade_date();
        let now = Utc::now();
        let mut out = HashMap::new();
        for row in &rows {
            if let Some(quote) = Self::quote_from_spot_row(row, trade_date, now) {
                if let Some(wanted) = &wanted {
                    if !wanted.contains(quote.code.as_str()) {
                        continue;
                    }
                }
                out.insert(quote.code.clone(), quote);
            }
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
        let code = canonicalize_code(code);
        let params = [
            ("symbol", code.clone()),
            ("period", period.as_str().to_string()),
            ("start_date", start.format("%Y%m%d").to_string()),
            ("end_date", end.format("%Y%m%d").to_string()),
            ("adjust", String::new()),
        ];
        let rows = with_transport_retry("akshare.stock_zh_a_hist", || {
            self.call("stock_zh_a_hist", &params)
        })
        .await?;

        let mut bars = Vec::with_capacity(rows.len());
        for row in &rows {
            let trade_date = match Self::date_field(row, "日期") {
                Some(d) => d,
                None => continue,
            };
            bars.push(DailyBar {
                code: code.clone(),
                source: "akshare".to_string(),
                trade_date,
                period,
                open: Self::f64_field(row, "开盘"),
                high: Self::f64_field(row, "最高"),
                low: Self::f64_field(row, "最低"),
                close: Self::f64_field(row, "收盘"),
                volume: Self::f64_field(row, "成交量").map(lots_to_shares),
                amount: Self::f64_field(row, "成交额"),
                turnover: Self::f64_field(row, "换手率"),
                change_percent: Self::f64_field(row, "涨跌幅"),
            });
        }
        bars.sort_by_key(|b| b.trade_date);
        Ok(bars)
    }

    async fn get_news(
        &self,
        code: Option<&str>,
        limit: usize,
    ) -> Result<Vec<NewsItem>, ProviderError> {
        let symbol = match code {
            Some(c) => canonicalize_code(c),
            None => return Err(ProviderError::Unsupported("market-wide news feed")),
        };

        let params = [("symbol", symbol.clone())];
        let rows = with_transport_retry("akshare.stock_news_em", || {
            self.call("stock_news_em", &params)
        })
        .await?;

        let mut out = Vec::new();
        for (i, row) in rows.iter().take(limit).enumerate() {
            let title = match Self::str_field(row, "新闻标题") {
                Some(t) if !t.is_empty() => t,
                _ => continue,
            };
            let published_at = Self::str_field(row, "发布时间")
                .and_then(|raw| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S").ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
                .unwrap_or_else(Utc::now);
            out.push(NewsItem {
                id: format!("{symbol}-{i}"),
                title,
                summary: Self::str_field(row, "新闻内容"),
                url: Self::str_field(row, "新闻链接").unwrap_or_default(),
                source: Self::str_field(row, "文章来源").unwrap_or_default(),
                published_at,
                symbols: vec![symbol.clone()],
            });
        }
        Ok(out)
    }

    async fn latest_trade_date(&self) -> Result<NaiveDate, ProviderError> {
        let rows = with_transport_retry("akshare.tool_trade_date_hist_sina", || {
            self.call("tool_trade_date_hist_sina", &[])
        })
        .await?;

        let today = Utc::now().date_naive();
        rows.iter()
            .filter_map(|row| Self::date_field(row, "trade_date"))
            .filter(|d| *d <= today)
            .max()
            .ok_or(ProviderError::NotFound)
    }

    async fn daily_basic_snapshot(
        &self,
        _trade_date: NaiveDate,
    ) -> Result<HashMap<String, FinancialSnapshot>, ProviderError> {
        // The EastMoney spot table carries the valuation columns; it always
        // reflects the current session, so the requested date is advisory.
        let rows = with_transport_retry("akshare.stock_zh_a_spot_em", || {
            self.call("stock_zh_a_spot_em", &[])
        })
        .await?;

        let mut out = HashMap::new();
        for row in &rows {
            let code = match Self::str_field(row, "代码") {
                Some(c) => canonicalize_code(&c),
                None => continue,
            };
            out.insert(
                code,
                FinancialSnapshot {
                    pe: Self::f64_field(row, "市盈率-动态"),
                    pb: Self::f64_field(row, "市净率"),
                    ps: None,
                    pe_ttm: None,
                    pb_mrq: None,
                    // Spot table reports yuan.
                    total_mv: Self::f64_field(row, "总市值").map(yuan_to_yi),
                    circ_mv: Self::f64_field(row, "流通市值").map(yuan_to_yi),
                    roe: None,
                    turnover_rate: Self::f64_field(row, "换手率"),
                    volume_ratio: Self::f64_field(row, "量比"),
                    total_share: None,
                    float_share: None,
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
    use serde_json::json;

    #[test]
    fn spot_row_converts_units() {
        let row = json!({
            "代码": "000001",
            "最新价": 10.0,
            "今开": 9.8,
            "最高": 10.2,
            "最低": 9.7,
            "昨收": 9.9,
            "涨跌额": 0.1,
            "涨跌幅": 1.01,
            "成交量": 150000.0,
            "成交额": 1.5e9,
        });
        let quote = AkshareProvider::quote_from_spot_row(
            &row,
            NaiveDate::from_ymd_opt(2025, 11, 5).unwrap(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(quote.code, "000001");
        // 手 -> shares
        assert_eq!(quote.volume, Some(15_000_000.0));
        assert_eq!(quote.amount, Some(1.5e9));
    }

    #[test]
    fn spot_row_without_price_is_skipped() {
        let row = json!({"代码": "000001", "最新价": null});
        assert!(AkshareProvider::quote_from_spot_row(
            &row,
            NaiveDate::from_ymd_opt(2025, 11, 5).unwrap(),
            Utc::now()
        )
        .is_none());
    }

    #[test]
    fn date_field_accepts_both_formats() {
        let row = json!({"日期": "2025-11-05", "alt": "20251105"});
        assert_eq!(
            AkshareProvider::date_field(&row, "日期"),
            NaiveDate::from_ymd_opt(2025, 11, 5)
        );
        assert_eq!(
            AkshareProvider::date_field(&row, "alt"),
            NaiveDate::from_ymd_opt(2025, 11, 5)
        );
    }
}
