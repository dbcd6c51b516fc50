//! `stock_basic_info` collection: one document per `(code, source)`.

use chrono::Utc;
use sqlx::Row;

use market_core::symbols::{canonicalize_code, full_symbol_for};
use market_core::{BasicInfo, FinancialSnapshot, StoreError};

use crate::{map_sqlx, ts_from_col, ts_to_col, BatchResult, MarketStore};

impl MarketStore {
    /// Idempotent batched upsert. Codes are canonicalized and
    /// `updated_at` is stamped at persist time; a record that fails to
    /// normalize is counted as an error without aborting the batch.
    pub async fn upsert_basic_info_batch(
        &self,
        records: &[BasicInfo],
    ) -> Result<BatchResult, StoreError> {
        let mut result = BatchResult::default();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let now = ts_to_col(Utc::now());

        for record in records {
            let code = canonicalize_code(&record.code);
            if code.is_empty() || record.source.is_empty() {
                result.errors += 1;
                continue;
            }
            let full_symbol = if record.full_symbol.is_empty() {
                full_symbol_for(&code)
            } else {
                record.full_symbol.clone()
            };
            let snap = record.financial_snapshot.clone().unwrap_or_default();

            let existing = sqlx::query("SELECT 1 FROM stock_basic_info WHERE code = ? AND source = ?")
                .bind(&code)
                .bind(&record.source)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?;

            let query = sqlx::query(
                "INSERT INTO stock_basic_info \
                 (code, full_symbol, name, industry, area, market, list_date, source, \
                  pe, pb, ps, pe_ttm, pb_mrq, total_mv, circ_mv, roe, turnover_rate, \
                  volume_ratio, total_share, float_share, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (code, source) DO UPDATE SET \
                  full_symbol = excluded.full_symbol, name = excluded.name, \
                  industry = excluded.industry, area = excluded.area, \
                  market = excluded.market, list_date = excluded.list_date, \
                  pe = excluded.pe, pb = excluded.pb, ps = excluded.ps, \
                  pe_ttm = excluded.pe_ttm, pb_mrq = excluded.pb_mrq, \
                  total_mv = excluded.total_mv, circ_mv = excluded.circ_mv, \
                  roe = excluded.roe, turnover_rate = excluded.turnover_rate, \
                  volume_ratio = excluded.volume_ratio, total_share = excluded.total_share, \
                  float_share = excluded.float_share, updated_at = excluded.updated_at",
            )
            .bind(&code)
            .bind(&full_symbol)
            .bind(&record.name)
            .bind(&record.industry)
            .bind(&record.area)
            .bind(&record.market)
            .bind(&record.list_date)
            .bind(&record.source)
            .bind(snap.pe)
            .bind(snap.pb)
            .bind(snap.ps)
            .bind(snap.pe_ttm)
            .bind(snap.pb_mrq)
            .bind(snap.total_mv)
            .bind(snap.circ_mv)
            .bind(snap.roe)
            .bind(snap.turnover_rate)
            .bind(snap.volume_ratio)
            .bind(snap.total_share)
            .bind(snap.float_share)
            .bind(&now);

            match query.execute(&mut *tx).await {
                Ok(_) => {
                    if existing.is_some() {
                        result.updated += 1;
                    } else {
                        result.inserted += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(code = code.as_str(), error = %e, "[WARN] basic info upsert failed");
                    result.errors += 1;
                }
            }
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(result)
    }

    /// All records for one code across sources; `source_order` decides
    /// which one a reader should prefer.
    pub async fn get_basic_info(
        &self,
        code: &str,
        source_order: &[String],
    ) -> Result<Option<BasicInfo>, StoreError> {
        let code = canonicalize_code(code);
        let rows = sqlx::query("SELECT * FROM stock_basic_info WHERE code = ?")
            .bind(&code)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let mut records: Vec<BasicInfo> = rows.iter().map(row_to_basic_info).collect();
        if records.is_empty() {
            return Ok(None);
        }
        records.sort_by_key(|r| {
            source_order
                .iter()
                .position(|s| *s == r.source)
                .unwrap_or(usize::MAX)
        });
        Ok(records.into_iter().next())
    }

    /// Distinct codes, preferring one row per code by source priority.
    pub async fn list_basic_info(
        &self,
        source_order: &[String],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<BasicInfo>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM stock_basic_info ORDER BY code LIMIT ? OFFSET ?",
        )
        .bind(limit * source_order.len().max(1) as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut seen = std::collections::HashSet::new();
        let mut records: Vec<BasicInfo> = rows.iter().map(row_to_basic_info).collect();
        records.sort_by_key(|r| {
            (
                r.code.clone(),
                source_order
                    .iter()
                    .position(|s| *s == r.source)
                    .unwrap_or(usize::MAX),
            )
        });
        records.retain(|r| seen.insert(r.code.clone()));
        records.truncate(limit as usize);
        Ok(records)
    }

    /// Substring search over code and name.
    pub async fn search_basic_info(
        &self,
        keyword: &str,
        limit: i64,
    ) -> Result<Vec<BasicInfo>, StoreError> {
        let pattern = format!("%{}%", keyword.trim());
        let rows = sqlx::query(
            "SELECT * FROM stock_basic_info WHERE code LIKE ? OR name LIKE ? \
             ORDER BY code LIMIT ?",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut seen = std::collections::HashSet::new();
        let mut records: Vec<BasicInfo> = rows.iter().map(row_to_basic_info).collect();
        records.retain(|r| seen.insert(r.code.clone()));
        Ok(records)
    }

    /// All codes known to any source (sync target enumeration).
    pub async fn all_codes(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT code FROM stock_basic_info ORDER BY code")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("code"))
            .collect())
    }
}

fn row_to_basic_info(row: &sqlx::sqlite::SqliteRow) -> BasicInfo {
    let snapshot = FinancialSnapshot {
        pe: row.get("pe"),
        pb: row.get("pb"),
        ps: row.get("ps"),
        pe_ttm: row.get("pe_ttm"),
        pb_mrq: row.get("pb_mrq"),
        total_mv: row.get("total_mv"),
        circ_mv: row.get("circ_mv"),
        roe: row.get("roe"),
        turnover_rate: row.get("turnover_rate"),
        volume_ratio: row.get("volume_ratio"),
        total_share: row.get("total_share"),
        float_share: row.get("float_share"),
    };
    BasicInfo {
        code: row.get("code"),
        full_symbol: row.get("full_symbol"),
        name: row.get("name"),
        industry: row.get("industry"),
        area: row.get("area"),
        market: row.get("market"),
        list_date: row.get("list_date"),
        source: row.get("source"),
        financial_snapshot: if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        },
        updated_at: ts_from_col(row.get::<String, _>("updated_at").as_str())
            .unwrap_or_else(Utc::now),
    }
}
