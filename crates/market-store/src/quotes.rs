//! `market_quotes` collection: latest quote per code.
//!
//! Writes are conditional on the trade date: a strictly older date is a
//! silent no-op (counted as skipped), so the stored `trade_date` never
//! decreases under concurrent automated writers.

use chrono::{NaiveDate, Utc};
use sqlx::Row;

use market_core::symbols::canonicalize_code;
use market_core::{Quote, StoreError};

use crate::{date_from_col, date_to_col, map_sqlx, ts_from_col, ts_to_col, BatchResult, MarketStore};

/// Outcome of one conditional quote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteWrite {
    Inserted,
    Updated,
    /// Incoming trade_date was older than the stored one.
    StaleSkipped,
}

impl MarketStore {
    /// Conditional upsert for realtime quotes: same-day re-writes update
    /// in place, strictly older trade dates are refused.
    pub async fn upsert_quote(&self, quote: &Quote) -> Result<QuoteWrite, StoreError> {
        self.write_quote(quote, false).await
    }

    /// Projection path (historical close into the quote store): writes
    /// only when the bar is strictly newer than the stored quote.
    pub async fn project_quote_if_newer(&self, quote: &Quote) -> Result<QuoteWrite, StoreError> {
        self.write_quote(quote, true).await
    }

    async fn write_quote(&self, quote: &Quote, strictly_newer: bool) -> Result<QuoteWrite, StoreError> {
        let code = canonicalize_code(&quote.code);
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let existing: Option<String> =
            sqlx::query("SELECT trade_date FROM market_quotes WHERE code = ?")
                .bind(&code)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?
                .map(|row| row.get("trade_date"));

        if let Some(stored) = existing.as_deref().and_then(date_from_col) {
            let acceptable = if strictly_newer {
                quote.trade_date > stored
            } else {
                quote.trade_date >= stored
            };
            if !acceptable {
                tx.rollback().await.map_err(map_sqlx)?;
                tracing::debug!(
                    code = code.as_str(),
                    incoming = %quote.trade_date,
                    stored = %stored,
                    "stale quote write skipped"
                );
                return Ok(QuoteWrite::StaleSkipped);
            }
        }

        sqlx::query(
            "INSERT INTO market_quotes \
             (code, price, open, high, low, pre_close, change, change_percent, \
              volume, amount, trade_date, source, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (code) DO UPDATE SET \
              price = excluded.price, open = excluded.open, high = excluded.high, \
              low = excluded.low, pre_close = excluded.pre_close, \
              change = excluded.change, change_percent = excluded.change_percent, \
              volume = excluded.volume, amount = excluded.amount, \
              trade_date = excluded.trade_date, source = excluded.source, \
              updated_at = excluded.updated_at",
        )
        .bind(&code)
        .bind(quote.price)
        .bind(quote.open)
        .bind(quote.high)
        .bind(quote.low)
        .bind(quote.pre_close)
        .bind(quote.change)
        .bind(quote.change_percent)
        .bind(quote.volume)
        .bind(quote.amount)
        .bind(date_to_col(quote.trade_date))
        .bind(&quote.source)
        .bind(ts_to_col(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(if existing.is_some() {
            QuoteWrite::Updated
        } else {
            QuoteWrite::Inserted
        })
    }

    /// Batched conditional upsert; stale rows are skipped, not errors.
    pub async fn upsert_quote_batch(&self, quotes: &[Quote]) -> Result<BatchResult, StoreError> {
        let mut result = BatchResult::default();
        for quote in quotes {
            match self.upsert_quote(quote).await {
                Ok(QuoteWrite::Inserted) => result.inserted += 1,
                Ok(QuoteWrite::Updated) => result.updated += 1,
                Ok(QuoteWrite::StaleSkipped) => result.skipped += 1,
                Err(StoreError::Unavailable(e)) => return Err(StoreError::Unavailable(e)),
                Err(e) => {
                    tracing::warn!(code = quote.code.as_str(), error = %e, "[WARN] quote upsert failed");
                    result.errors += 1;
                }
            }
        }
        Ok(result)
    }

    pub async fn get_quote(&self, code: &str) -> Result<Option<Quote>, StoreError> {
        let code = canonicalize_code(code);
        let row = sqlx::query("SELECT * FROM market_quotes WHERE code = ?")
            .bind(&code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.as_ref().map(row_to_quote))
    }

    pub async fn latest_quote_trade_date(&self) -> Result<Option<NaiveDate>, StoreError> {
        let row = sqlx::query("SELECT MAX(trade_date) AS max_date FROM market_quotes")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let raw: Option<String> = row.get("max_date");
        Ok(raw.as_deref().and_then(date_from_col))
    }
}

fn row_to_quote(row: &sqlx::sqlite::SqliteRow) -> Quote {
    Quote {
        code: row.get("code"),
        price: row.get("price"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        pre_close: row.get("pre_close"),
        change: row.get("change"),
        change_percent: row.get("change_percent"),
        volume: row.get("volume"),
        amount: row.get("amount"),
        trade_date: date_from_col(row.get::<String, _>("trade_date").as_str())
            .unwrap_or_else(|| Utc::now().date_naive()),
        source: row.get("source"),
        updated_at: ts_from_col(row.get::<String, _>("updated_at").as_str())
            .unwrap_or_else(Utc::now),
    }
}
