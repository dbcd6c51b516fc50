//! `sync_status` collection: one row per `(job, data_type)`.

use sqlx::Row;

use market_core::{StoreError, SyncState, SyncStatus};

use crate::{map_sqlx, ts_from_col, ts_to_col, MarketStore};

impl MarketStore {
    pub async fn persist_sync_status(&self, status: &SyncStatus) -> Result<(), StoreError> {
        let sources = serde_json::to_string(&status.data_sources_used)
            .unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO sync_status \
             (job, data_type, status, started_at, finished_at, total, inserted, \
              updated, errors, data_sources_used, message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (job, data_type) DO UPDATE SET \
              status = excluded.status, started_at = excluded.started_at, \
              finished_at = excluded.finished_at, total = excluded.total, \
              inserted = excluded.inserted, updated = excluded.updated, \
              errors = excluded.errors, \
              data_sources_used = excluded.data_sources_used, \
              message = excluded.message",
        )
        .bind(&status.job)
        .bind(&status.data_type)
        .bind(status.status.as_str())
        .bind(status.started_at.map(ts_to_col))
        .bind(status.finished_at.map(ts_to_col))
        .bind(status.total)
        .bind(status.inserted)
        .bind(status.updated)
        .bind(status.errors)
        .bind(sources)
        .bind(&status.message)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn get_sync_status(
        &self,
        job: &str,
        data_type: &str,
    ) -> Result<Option<SyncStatus>, StoreError> {
        let row = sqlx::query("SELECT * FROM sync_status WHERE job = ? AND data_type = ?")
            .bind(job)
            .bind(data_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok(row.map(|row| SyncStatus {
            job: row.get("job"),
            data_type: row.get("data_type"),
            status: SyncState::parse(row.get::<String, _>("status").as_str())
                .unwrap_or(SyncState::Idle),
            started_at: row
                .get::<Option<String>, _>("started_at")
                .as_deref()
                .and_then(ts_from_col),
            finished_at: row
                .get::<Option<String>, _>("finished_at")
                .as_deref()
                .and_then(ts_from_col),
            total: row.get("total"),
            inserted: row.get("inserted"),
            updated: row.get("updated"),
            errors: row.get("errors"),
            data_sources_used: serde_json::from_str(
                row.get::<String, _>("data_sources_used").as_str(),
            )
            .unwrap_or_default(),
            message: row.get("message"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::memory_store;
    use chrono::Utc;
    use market_core::{SyncState, SyncStatus};

    #[tokio::test]
    async fn status_round_trips() {
        let store = memory_store().await;
        assert!(store
            .get_sync_status("stock_basics", "basic_info")
            .await
            .unwrap()
            .is_none());

        let mut status = SyncStatus::idle("stock_basics", "basic_info");
        status.status = SyncState::Running;
        status.started_at = Some(Utc::now());
        status.total = 5000;
        status.data_sources_used = vec!["stock_list:tushare".to_string()];
        store.persist_sync_status(&status).await.unwrap();

        status.status = SyncState::SuccessWithErrors;
        status.inserted = 4900;
        status.errors = 100;
        status.finished_at = Some(Utc::now());
        store.persist_sync_status(&status).await.unwrap();

        let loaded = store
            .get_sync_status("stock_basics", "basic_info")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, SyncState::SuccessWithErrors);
        assert_eq!(loaded.inserted, 4900);
        assert_eq!(loaded.errors, 100);
        assert_eq!(loaded.data_sources_used, vec!["stock_list:tushare"]);
    }
}
