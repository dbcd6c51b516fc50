//! `stock_financial_data` collection: one document per
//! `(symbol, report_period, data_source)`; history is preserved.

use chrono::Utc;
use sqlx::Row;

use market_core::symbols::canonicalize_code;
use market_core::{FinancialRecord, ReportType, StoreError};

use crate::{map_sqlx, ts_to_col, BatchResult, MarketStore};

impl MarketStore {
    pub async fn upsert_financials_batch(
        &self,
        records: &[FinancialRecord],
    ) -> Result<BatchResult, StoreError> {
        let mut result = BatchResult::default();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let now = ts_to_col(Utc::now());

        for record in records {
            let symbol = canonicalize_code(&record.symbol);
            if symbol.is_empty() || record.report_period.is_empty() || record.source.is_empty() {
                result.errors += 1;
                continue;
            }
            let statements = record
                .statements
                .as_ref()
                .map(|s| s.to_string());

            let existing = sqlx::query(
                "SELECT 1 FROM stock_financial_data \
                 WHERE symbol = ? AND report_period = ? AND data_source = ?",
            )
            .bind(&symbol)
            .bind(&record.report_period)
            .bind(&record.source)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            let write = sqlx::query(
                "INSERT INTO stock_financial_data \
                 (symbol, report_period, data_source, report_type, revenue, net_income, \
                  eps, roe, debt_to_assets, gross_margin, statements, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (symbol, report_period, data_source) DO UPDATE SET \
                  report_type = excluded.report_type, revenue = excluded.revenue, \
                  net_income = excluded.net_income, eps = excluded.eps, \
                  roe = excluded.roe, debt_to_assets = excluded.debt_to_assets, \
                  gross_margin = excluded.gross_margin, statements = excluded.statements, \
                  updated_at = excluded.updated_at",
            )
            .bind(&symbol)
            .bind(&record.report_period)
            .bind(&record.source)
            .bind(record.report_type.as_str())
            .bind(record.revenue)
            .bind(record.net_income)
            .bind(record.eps)
            .bind(record.roe)
            .bind(record.debt_to_assets)
            .bind(record.gross_margin)
            .bind(statements)
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
                    tracing::warn!(symbol = symbol.as_str(), error = %e, "[WARN] financial upsert failed");
                    result.errors += 1;
                }
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(result)
    }

    /// Report periods newest-first for one symbol.
    pub async fn list_financials(
        &self,
        symbol: &str,
        source: Option<&str>,
        limit: i64,
    ) -> Result<Vec<FinancialRecord>, StoreError> {
        let symbol = canonicalize_code(symbol);
        let rows = match source {
            Some(source) => {
                sqlx::query(
                    "SELECT * FROM stock_financial_data \
                     WHERE symbol = ? AND data_source = ? \
                     ORDER BY report_period DESC LIMIT ?",
                )
                .bind(&symbol)
                .bind(source)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM stock_financial_data \
                     WHERE symbol = ? ORDER BY report_period DESC LIMIT ?",
                )
                .bind(&symbol)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx)?;

        Ok(rows.iter().map(row_to_financial).collect())
    }
}

fn row_to_financial(row: &sqlx::sqlite::SqliteRow) -> FinancialRecord {
    let report_type = match row.get::<String, _>("report_type").as_str() {
        "annual" => ReportType::Annual,
        _ => ReportType::Quarterly,
    };
    FinancialRecord {
        symbol: row.get("symbol"),
        report_period: row.get("report_period"),
        source: row.get("data_source"),
        report_type,
        revenue: row.get("revenue"),
        net_income: row.get("net_income"),
        eps: row.get("eps"),
        roe: row.get("roe"),
        debt_to_assets: row.get("debt_to_assets"),
        gross_margin: row.get("gross_margin"),
        statements: row
            .get::<Option<String>, _>("statements")
            .and_then(|s| serde_json::from_str(&s).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store;
    use serde_json::json;

    fn record(symbol: &str, period: &str, revenue: f64) -> FinancialRecord {
        FinancialRecord {
            symbol: symbol.to_string(),
            report_period: period.to_string(),
            source: "tushare".to_string(),
            report_type: if period.ends_with("1231") {
                ReportType::Annual
            } else {
                ReportType::Quarterly
            },
            revenue: Some(revenue),
            net_income: Some(revenue * 0.1),
            eps: Some(0.45),
            roe: Some(11.2),
            debt_to_assets: Some(62.0),
            gross_margin: Some(28.5),
            statements: Some(json!({"income": {"total_revenue": revenue}})),
        }
    }

    #[tokio::test]
    async fn each_report_period_is_its_own_document() {
        let store = memory_store().await;
        let result = store
            .upsert_financials_batch(&[
                record("600000", "20241231", 1.9e10),
                record("600000", "20250331", 4.6e9),
                record("600000", "20250630", 9.4e9),
            ])
            .await
            .unwrap();
        assert_eq!(result.inserted, 3);

        let records = store.list_financials("600000", None, 10).await.unwrap();
        assert_eq!(records.len(), 3);
        // Newest period first.
        assert_eq!(records[0].report_period, "20250630");
        assert_eq!(records[2].report_type, ReportType::Annual);
        assert!(records[0].statements.is_some());
    }

    #[tokio::test]
    async fn resync_updates_in_place() {
        let store = memory_store().await;
        store
            .upsert_financials_batch(&[record("600000", "20250331", 4.6e9)])
            .await
            .unwrap();
        let result = store
            .upsert_financials_batch(&[record("600000", "20250331", 4.7e9)])
            .await
            .unwrap();
        assert_eq!(result.updated, 1);
        let records = store.list_financials("600000", None, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].revenue, Some(4.7e9));
    }
}
