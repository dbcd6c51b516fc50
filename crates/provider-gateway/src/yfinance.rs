//! Yahoo Finance adapter (query1.finance.yahoo.com v8 chart JSON).
//!
//! Covers US/HK symbols and the Yahoo-suffixed CN forms. Listing the full
//! market and CN valuation snapshots are not in the vendor's contract and
//! report `Unsupported`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;

use market_core::symbols::{canonicalize_code, full_symbol_for};
use market_core::{BasicInfo, DailyBar, Period, ProviderError, Quote};

use crate::{map_reqwest_error, with_transport_retry, MarketDataProvider, DEFAULT_TIMEOUT};

const BASE_URL: &str = "https://query1.finance.yahoo.com";

pub struct YfinanceProvider {
    client: Client,
}

impl YfinanceProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent("Mozilla/5.0 (compatible; marketflow/0.1)")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// Yahoo ticker for a canonical code: CN codes get their exchange
    /// suffix, everything else passes through.
    fn yahoo_symbol(code: &str) -> String {
        let code = canonicalize_code(code);
        if code.chars().all(|c| c.is_ascii_digit()) && code.len() == 6 {
            full_symbol_for(&code)
        } else {
            code
        }
    }

    fn interval_for(period: Period) -> &'static str {
        match period {
            Period::Daily => "1d",
            Period::Weekly => "1wk",
            Period::Monthly => "1mo",
        }
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ProviderError> {
        let url = format!("{BASE_URL}/v8/finance/chart/{symbol}");
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ProviderError::NotFound);
        }
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited(format!("yahoo HTTP {status}")));
        }
        if !status.is_success() {
            return Err(if status.is_server_error() {
                ProviderError::Transient(format!("yahoo HTTP {status}"))
            } else {
                ProviderError::Permanent(format!("yahoo HTTP {status}"))
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("yahoo decode: {e}")))?;

        if let Some(err) = body.pointer("/chart/error").filter(|e| !e.is_null()) {
            let code = err.get("code").and_then(|c| c.as_str()).unwrap_or("");
            return Err(if code == "Not Found" {
                ProviderError::NotFound
            } else {
                ProviderError::Permanent(format!("yahoo chart error: {code}"))
            });
        }

        body.pointer("/chart/result/0")
            .cloned()
            .ok_or(ProviderError::NotFound)
    }

    fn date_from_epoch(epoch: i64) -> Option<NaiveDate> {
        DateTime::<Utc>::from_timestamp(epoch, 0).map(|dt| dt.date_naive())
    }
}

impl Default for YfinanceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for YfinanceProvider {
    fn name(&self) -> &'static str {
        "yfinance"
    }

    async fn get_basic_info(&self, code: &str) -> Result<BasicInfo, ProviderError> {
        let symbol = Self::yahoo_symbol(code);
        let query = [("range", "1d".to_string()), ("interval", "1d".to_string())];
        let result = with_transport_retry("yfinance.chart_meta", || {
            self.fetch_chart(&symbol, &query)
        })
        .await?;

        let meta = result.get("meta").ok_or(ProviderError::NotFound)?;
        let code = canonicalize_code(code);
        Ok(BasicInfo {
            full_symbol: symbol.clone(),
            code,
            name: meta
                .get("longName")
                .or_else(|| meta.get("shortName"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            industry: String::new(),
            area: String::new(),
            market: meta
                .get("exchangeName")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            list_date: String::new(),
            source: "yfinance".to_string(),
            financial_snapshot: None,
            updated_at: Utc::now(),
        })
    }

    async fn get_quote(&self, code: &str) -> Result<Quote, ProviderError> {
        let symbol = Self::yahoo_symbol(code);
        let query = [("range", "1d".to_string()), ("interval", "1d".to_string())];
        let result = with_transport_retry("yfinance.quote", || {
            self.fetch_chart(&symbol, &query)
        })
        .await?;

        let meta = result.get("meta").ok_or(ProviderError::NotFound)?;
        let price = meta
            .get("regularMarketPrice")
            .and_then(|v| v.as_f64())
            .ok_or(ProviderError::NotFound)?;
        let pre_close = meta
            .get("chartPreviousClose")
            .or_else(|| meta.get("previousClose"))
            .and_then(|v| v.as_f64());
        let trade_date = meta
            .get("regularMarketTime")
            .and_then(|v| v.as_i64())
            .and_then(Self::date_from_epoch)
            .unwrap_or_else(|| Utc::now().date_naive());

        Ok(Quote {
            code: canonicalize_code(code),
            price,
            open: None,
            high: meta.get("regularMarketDayHigh").and_then(|v| v.as_f64()),
            low: meta.get("regularMarketDayLow").and_then(|v| v.as_f64()),
            pre_close,
            change: pre_close.map(|pc| price - pc),
            change_percent: pre_close
                .filter(|pc| *pc != 0.0)
                .map(|pc| (price - pc) / pc * 100.0),
            volume: meta
                .get("regularMarketVolume")
                .and_then(|v| v.as_f64()),
            amount: None,
            trade_date,
            source: "yfinance".to_string(),
            updated_at: Utc::now(),
        })
    }

    async fn get_quote_batch(
        &self,
        codes: &[String],
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        // No multi-symbol endpoint without auth; serial single fetches are
        // acceptable for the small international watchlists this serves.
        let mut out = HashMap::new();
        for code in codes {
            match self.get_quote(code).await {
                Ok(quote) => {
                    out.insert(quote.code.clone(), quote);
                }
                Err(ProviderError::NotFound) => continue,
                Err(e) => return Err(e),
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
        let symbol = Self::yahoo_symbol(code);
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default();
        let period1 = Utc.from_utc_datetime(&start.and_time(midnight)).timestamp();
        let period2 = Utc
            .from_utc_datetime(&end.succ_opt().unwrap_or(end).and_time(midnight))
            .timestamp();
        let query = [
            ("period1", period1.to_string()),
            ("period2", period2.to_string()),
            ("interval", Self::interval_for(period).to_string()),
            ("events", "history".to_string()),
        ];

        let result = with_transport_retry("yfinance.bars", || {
            self.fetch_chart(&symbol, &query)
        })
        .await?;

        let timestamps = result
            .pointer("/timestamp")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let quote = result
            .pointer("/indicators/quote/0")
            .cloned()
            .unwrap_or(Value::Null);

        let series = |name: &str| -> Vec<Option<f64>> {
            quote
                .get(name)
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().map(|v| v.as_f64()).collect())
                .unwrap_or_default()
        };
        let opens = series("open");
        let highs = series("high");
        let lows = series("low");
        let closes = series("close");
        let volumes = series("volume");

        let code = canonicalize_code(code);
        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            let trade_date = match ts.as_i64().and_then(Self::date_from_epoch) {
                Some(d) => d,
                None => continue,
            };
            let close = closes.get(i).copied().flatten();
            if close.is_none() {
                // Yahoo pads holidays with null rows.
                continue;
            }
            bars.push(DailyBar {
                code: code.clone(),
                source: "yfinance".to_string(),
                trade_date,
                period,
                open: opens.get(i).copied().flatten(),
                high: highs.get(i).copied().flatten(),
                low: lows.get(i).copied().flatten(),
                close,
                volume: volumes.get(i).copied().flatten(),
                amount: None,
                turnover: None,
                change_percent: None,
            });
        }
        Ok(bars)
    }

    async fn latest_trade_date(&self) -> Result<NaiveDate, ProviderError> {
        // Probe a liquid index proxy; its last session is the market's.
        let quote = self.get_quote("SPY").await?;
        Ok(quote.trade_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cn_codes_get_yahoo_suffix() {
        assert_eq!(YfinanceProvider::yahoo_symbol("600000"), "600000.SS");
        assert_eq!(YfinanceProvider::yahoo_symbol("000001"), "000001.SZ");
        assert_eq!(YfinanceProvider::yahoo_symbol("AAPL"), "AAPL");
        assert_eq!(YfinanceProvider::yahoo_symbol("0700.HK"), "0700.HK");
    }

    #[test]
    fn interval_mapping() {
        assert_eq!(YfinanceProvider::interval_for(Period::Daily), "1d");
        assert_eq!(YfinanceProvider::interval_for(Period::Weekly), "1wk");
        assert_eq!(YfinanceProvider::interval_for(Period::Monthly), "1mo");
    }

    #[test]
    fn epoch_to_exchange_date() {
        // 2025-11-05 14:30:00 UTC
        assert_eq!(
            YfinanceProvider::date_from_epoch(1762353000),
            NaiveDate::from_ymd_opt(2025, 11, 5)
        );
    }
}
