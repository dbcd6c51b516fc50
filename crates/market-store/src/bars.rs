//! `stock_daily_quotes` collection: one bar per
//! `(code, source, trade_date, period)`.

use chrono::{NaiveDate, Utc};
use sqlx::Row;

use market_core::symbols::canonicalize_code;
use market_core::{DailyBar, Period, StoreError};

use crate::{date_from_col, date_to_col, map_sqlx, ts_to_col, BatchResult, MarketStore};

impl MarketStore {
    pub async fn upsert_bars_batch(&self, bars: &[DailyBar]) -> Result<BatchResult, StoreError> {
        let mut result = BatchResult::default();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let now = ts_to_col(Utc::now());

        for bar in bars {
            let code = canonicalize_code(&bar.code);
            if code.is_empty() || bar.source.is_empty() {
                result.errors += 1;
                continue;
            }
            let trade_date = date_to_col(bar.trade_date);

            let existing = sqlx::query(
                "SELECT 1 FROM stock_daily_quotes \
                 WHERE code = ? AND source = ? AND trade_date = ? AND period = ?",
            )
            .bind(&code)
            .bind(&bar.source)
            .bind(&trade_date)
            .bind(bar.period.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            let write = sqlx::query(
                "INSERT INTO stock_daily_quotes \
                 (code, source, trade_date, period, open, high, low, close, \
                  volume, amount, turnover, change_percent, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (code, source, trade_date, period) DO UPDATE SET \
                  open = excluded.open, high = excluded.high, low = excluded.low, \
                  close = excluded.close, volume = excluded.volume, \
                  amount = excluded.amount, turnover = excluded.turnover, \
                  change_percent = excluded.change_percent, updated_at = excluded.updated_at",
            )
            .bind(&code)
            .bind(&bar.source)
            .bind(&trade_date)
            .bind(bar.period.as_str())
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .bind(bar.amount)
            .bind(bar.turnover)
            .bind(bar.change_percent)
            .bind(&now)
            .execute(&mut *tx)
            .await;

            match write {
                Ok(_) => {
                    if existing.is_some() {
                        result.updated += 1;
                    } else {
                        result.inserted += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(code = code.as_str(), error = %e, "[WARN] bar upsert failed");
                    result.errors += 1;
                }
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(result)
    }

    /// Newest stored trade date for one series; incremental syncs resume
    /// past this point.
    pub async fn max_bar_trade_date(
        &self,
        code: &str,
        source: &str,
        period: Period,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query(
            "SELECT MAX(trade_date) AS max_date FROM stock_daily_quotes \
             WHERE code = ? AND source = ? AND period = ?",
        )
        .bind(canonicalize_code(code))
        .bind(source)
        .bind(period.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let raw: Option<String> = row.get("max_date");
        Ok(raw.as_deref().and_then(date_from_col))
    }

    /// Latest stored bar for one series (quote projection after a
    /// historical sync).
    pub async fn latest_bar(
        &self,
        code: &str,
        source: &str,
        period: Period,
    ) -> Result<Option<DailyBar>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM stock_daily_quotes \
             WHERE code = ? AND source = ? AND period = ? \
             ORDER BY trade_date DESC LIMIT 1",
        )
        .bind(canonicalize_code(code))
        .bind(source)
        .bind(period.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.as_ref().and_then(row_to_bar))
    }

    pub async fn list_bars(
        &self,
        code: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
        source: Option<&str>,
    ) -> Result<Vec<DailyBar>, StoreError> {
        let code = canonicalize_code(code);
        let rows = match source {
            Some(source) => {
                sqlx::query(
                    "SELECT * FROM stock_daily_quotes \
                     WHERE code = ? AND period = ? AND source = ? \
                       AND trade_date >= ? AND trade_date <= ? \
                     ORDER BY trade_date",
                )
                .bind(&code)
                .bind(period.as_str())
                .bind(source)
                .bind(date_to_col(start))
                .bind(date_to_col(end))
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM stock_daily_quotes \
                     WHERE code = ? AND period = ? \
                       AND trade_date >= ? AND trade_date <= ? \
                     ORDER BY trade_date",
                )
                .bind(&code)
                .bind(period.as_str())
                .bind(date_to_col(start))
                .bind(date_to_col(end))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx)?;

        Ok(rows.iter().filter_map(row_to_bar).collect())
    }

    pub async fn count_bars(&self, code: &str, period: Period) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM stock_daily_quotes WHERE code = ? AND period = ?",
        )
        .bind(canonicalize_code(code))
        .bind(period.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.get("n"))
    }
}

fn row_to_bar(row: &sqlx::sqlite::SqliteRow) -> Option<DailyBar> {
    Some(DailyBar {
        code: row.get("code"),
        source: row.get("source"),
        trade_date: date_from_col(row.get::<String, _>("trade_date").as_str())?,
        period: Period::parse(row.get::<String, _>("period").as_str())?,
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
        amount: row.get("amount"),
        turnover: row.get("turnover"),
        change_percent: row.get("change_percent"),
    })
}
