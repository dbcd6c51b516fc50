//! `analysis_tasks` / `analysis_batches` collections.
//!
//! Enqueue operations run inside one transaction so quota checks and the
//! inserts they gate are atomic. Workers claim tasks by compare-and-set on
//! `status`, which serializes each task's lifecycle on its unique id.

use chrono::{DateTime, Utc};
use sqlx::Row;

use market_core::config::QuotaConfig;
use market_core::{
    AnalysisBatch, AnalysisOutcome, AnalysisParameters, AnalysisTask, BatchStatus, QueueError,
    StoreError, TaskStatus,
};

use crate::{map_sqlx, ts_from_col, ts_to_col, MarketStore};

#[derive(Debug, Clone)]
pub struct TaskPage {
    pub items: Vec<AnalysisTask>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl MarketStore {
    /// Atomically quota-check and insert one task.
    pub async fn enqueue_task(
        &self,
        task: &AnalysisTask,
        quotas: &QuotaConfig,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        Self::check_quotas_tx(&mut tx, &task.user_id, 1, quotas).await?;
        Self::insert_task_tx(&mut tx, task).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    /// Atomically quota-check and insert a batch with its children. If any
    /// child cannot be enqueued, nothing is written.
    pub async fn enqueue_batch(
        &self,
        batch: &AnalysisBatch,
        tasks: &[AnalysisTask],
        quotas: &QuotaConfig,
    ) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        Self::check_quotas_tx(&mut tx, &batch.user_id, tasks.len() as i64, quotas).await?;

        sqlx::query(
            "INSERT INTO analysis_batches \
             (batch_id, user_id, title, status, total_tasks, completed_tasks, \
              failed_tasks, cancelled_tasks, progress, created_at) \
             VALUES (?, ?, ?, ?, ?, 0, 0, 0, 0, ?)",
        )
        .bind(&batch.batch_id)
        .bind(&batch.user_id)
        .bind(&batch.title)
        .bind(batch.status.as_str())
        .bind(tasks.len() as i64)
        .bind(ts_to_col(batch.created_at))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for task in tasks {
            Self::insert_task_tx(&mut tx, task).await?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn check_quotas_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: &str,
        incoming: i64,
        quotas: &QuotaConfig,
    ) -> Result<(), QueueError> {
        let unfinished: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM analysis_tasks \
             WHERE user_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx)?
        .get("n");
        if unfinished + incoming > quotas.concurrent_limit {
            return Err(QueueError::QuotaExceededConcurrent {
                current: unfinished,
                limit: quotas.concurrent_limit,
            });
        }

        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            .unwrap_or_else(Utc::now);
        let today: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM analysis_tasks WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(ts_to_col(day_start))
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx)?
        .get("n");
        if today + incoming > quotas.daily_quota {
            return Err(QueueError::QuotaExceededDaily {
                current: today,
                limit: quotas.daily_quota,
            });
        }
        Ok(())
    }

    async fn insert_task_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task: &AnalysisTask,
    ) -> Result<(), StoreError> {
        let parameters = serde_json::to_string(&task.parameters)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO analysis_tasks \
             (task_id, batch_id, user_id, symbol, status, progress, created_at, \
              parameters, retry_count, max_retries) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(&task.batch_id)
        .bind(&task.user_id)
        .bind(&task.symbol)
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(ts_to_col(task.created_at))
        .bind(parameters)
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// Compare-and-set claim: pending -> processing. Returns false when
    /// another worker got there first (or the task was cancelled).
    pub async fn claim_task(&self, task_id: &str, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE analysis_tasks \
             SET status = 'processing', started_at = ?, worker_id = ? \
             WHERE task_id = ? AND status = 'pending'",
        )
        .bind(ts_to_col(Utc::now()))
        .bind(worker_id)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    /// Monotonic progress update; regressions are ignored in SQL.
    pub async fn update_task_progress(
        &self,
        task_id: &str,
        progress: u8,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE analysis_tasks SET progress = MAX(progress, ?) \
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(progress.min(100) as i64)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        outcome: &AnalysisOutcome,
    ) -> Result<(), StoreError> {
        let result = serde_json::to_string(outcome)
            .map_err(|e| StoreError::Query(e.to_string()))?;
        sqlx::query(
            "UPDATE analysis_tasks \
             SET status = 'completed', progress = 100, completed_at = ?, result = ? \
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(ts_to_col(Utc::now()))
        .bind(result)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE analysis_tasks \
             SET status = 'failed', completed_at = ?, last_error = ? \
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(ts_to_col(Utc::now()))
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// The retry back-edge: processing -> pending with the count bumped.
    pub async fn requeue_task(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE analysis_tasks \
             SET status = 'pending', retry_count = retry_count + 1, \
                 last_error = ?, worker_id = NULL \
             WHERE task_id = ? AND status = 'processing'",
        )
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// Cancel a task that has not finished. Pending tasks cancel
    /// unconditionally; processing tasks are marked here only after the
    /// worker observed the cancel flag.
    pub async fn mark_task_cancelled(
        &self,
        task_id: &str,
        from: TaskStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE analysis_tasks SET status = 'cancelled', completed_at = ? \
             WHERE task_id = ? AND status = ?",
        )
        .bind(ts_to_col(Utc::now()))
        .bind(task_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<AnalysisTask>, StoreError> {
        let row = sqlx::query("SELECT * FROM analysis_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.as_ref().map(row_to_task))
    }

    pub async fn list_tasks(
        &self,
        user_id: &str,
        status: Option<TaskStatus>,
        page: i64,
        page_size: i64,
    ) -> Result<TaskPage, StoreError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let offset = (page - 1) * page_size;

        let (total, rows) = match status {
            Some(status) => {
                let total: i64 = sqlx::query(
                    "SELECT COUNT(*) AS n FROM analysis_tasks WHERE user_id = ? AND status = ?",
                )
                .bind(user_id)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?
                .get("n");
                let rows = sqlx::query(
                    "SELECT * FROM analysis_tasks WHERE user_id = ? AND status = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(status.as_str())
                .bind(page_size)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
                (total, rows)
            }
            None => {
                let total: i64 =
                    sqlx::query("SELECT COUNT(*) AS n FROM analysis_tasks WHERE user_id = ?")
                        .bind(user_id)
                        .fetch_one(&self.pool)
                        .await
                        .map_err(map_sqlx)?
                        .get("n");
                let rows = sqlx::query(
                    "SELECT * FROM analysis_tasks WHERE user_id = ? \
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(user_id)
                .bind(page_size)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
                (total, rows)
            }
        };

        Ok(TaskPage {
            items: rows.iter().map(row_to_task).collect(),
            total,
            page,
            page_size,
        })
    }

    pub async fn count_unfinished_tasks(&self, user_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM analysis_tasks \
             WHERE user_id = ? AND status IN ('pending', 'processing')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.get("n"))
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<AnalysisBatch>, StoreError> {
        let row = sqlx::query("SELECT * FROM analysis_batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.as_ref().map(row_to_batch))
    }

    /// Re-derive a batch's progress and status from its children; called
    /// whenever a child terminates.
    pub async fn recompute_batch(
        &self,
        batch_id: &str,
    ) -> Result<Option<AnalysisBatch>, StoreError> {
        let children = sqlx::query(
            "SELECT status, progress FROM analysis_tasks WHERE batch_id = ?",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if children.is_empty() {
            return Ok(None);
        }

        let total = children.len() as i64;
        let mut completed = 0i64;
        let mut failed = 0i64;
        let mut cancelled = 0i64;
        let mut progress_sum = 0i64;
        for child in &children {
            let status: String = child.get("status");
            let progress: i64 = child.get("progress");
            progress_sum += progress;
            match status.as_str() {
                "completed" => completed += 1,
                "failed" => failed += 1,
                "cancelled" => cancelled += 1,
                _ => {}
            }
        }
        let terminal = completed + failed + cancelled;
        let progress = (progress_sum / total) as u8;
        let status = if terminal < total {
            if terminal > 0 || progress > 0 {
                BatchStatus::Processing
            } else {
                BatchStatus::Pending
            }
        } else if completed == total {
            BatchStatus::Completed
        } else if cancelled == total {
            BatchStatus::Cancelled
        } else if completed > 0 {
            BatchStatus::PartialSuccess
        } else {
            BatchStatus::Failed
        };
        let completed_at = if terminal == total {
            Some(ts_to_col(Utc::now()))
        } else {
            None
        };

        sqlx::query(
            "UPDATE analysis_batches \
             SET status = ?, completed_tasks = ?, failed_tasks = ?, \
                 cancelled_tasks = ?, progress = ?, \
                 completed_at = COALESCE(completed_at, ?) \
             WHERE batch_id = ?",
        )
        .bind(status.as_str())
        .bind(completed)
        .bind(failed)
        .bind(cancelled)
        .bind(progress as i64)
        .bind(completed_at)
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        self.get_batch(batch_id).await
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> AnalysisTask {
    AnalysisTask {
        task_id: row.get("task_id"),
        batch_id: row.get("batch_id"),
        user_id: row.get("user_id"),
        symbol: row.get("symbol"),
        status: TaskStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(TaskStatus::Pending),
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        created_at: ts_from_col(row.get::<String, _>("created_at").as_str())
            .unwrap_or_else(Utc::now),
        started_at: row
            .get::<Option<String>, _>("started_at")
            .as_deref()
            .and_then(ts_from_col),
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .as_deref()
            .and_then(ts_from_col),
        worker_id: row.get("worker_id"),
        parameters: serde_json::from_str(row.get::<String, _>("parameters").as_str())
            .unwrap_or_else(|_| AnalysisParameters::default()),
        result: row
            .get::<Option<String>, _>("result")
            .and_then(|s| serde_json::from_str(&s).ok()),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        last_error: row.get("last_error"),
    }
}

fn row_to_batch(row: &sqlx::sqlite::SqliteRow) -> AnalysisBatch {
    AnalysisBatch {
        batch_id: row.get("batch_id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        status: BatchStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(BatchStatus::Pending),
        total_tasks: row.get("total_tasks"),
        completed_tasks: row.get("completed_tasks"),
        failed_tasks: row.get("failed_tasks"),
        cancelled_tasks: row.get("cancelled_tasks"),
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        created_at: ts_from_col(row.get::<String, _>("created_at").as_str())
            .unwrap_or_else(Utc::now),
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .as_deref()
            .and_then(ts_from_col),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store;
    use market_core::AnalysisParameters;
    use uuid::Uuid;

    fn quotas() -> QuotaConfig {
        QuotaConfig {
            daily_quota: 1000,
            concurrent_limit: 3,
        }
    }

    fn task(user: &str, symbol: &str) -> AnalysisTask {
        AnalysisTask::new(user, symbol, AnalysisParameters::default(), 3)
    }

    #[tokio::test]
    async fn concurrent_limit_rejects_fourth_task() {
        let store = memory_store().await;
        for i in 0..3 {
            store
                .enqueue_task(&task("u1", &format!("60000{i}")), &quotas())
                .await
                .unwrap();
        }
        let err = store
            .enqueue_task(&task("u1", "600003"), &quotas())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "quota-exceeded-concurrent");
        // No fourth row was created.
        assert_eq!(store.count_unfinished_tasks("u1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn daily_quota_rejects_after_limit() {
        let store = memory_store().await;
        let quotas = QuotaConfig {
            daily_quota: 2,
            concurrent_limit: 100,
        };
        store.enqueue_task(&task("u1", "600000"), &quotas).await.unwrap();
        store.enqueue_task(&task("u1", "600001"), &quotas).await.unwrap();
        let err = store
            .enqueue_task(&task("u1", "600002"), &quotas)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "quota-exceeded-daily");
    }

    #[tokio::test]
    async fn batch_enqueue_is_all_or_nothing() {
        let store = memory_store().await;
        let quotas = QuotaConfig {
            daily_quota: 5,
            concurrent_limit: 100,
        };
        let batch_id = Uuid::new_v4().to_string();
        let tasks: Vec<AnalysisTask> = (0..10)
            .map(|i| {
                let mut t = task("u1", &format!("6000{i:02}"));
                t.batch_id = Some(batch_id.clone());
                t
            })
            .collect();
        let batch = AnalysisBatch {
            batch_id: batch_id.clone(),
            user_id: "u1".to_string(),
            title: "ten stocks".to_string(),
            status: BatchStatus::Pending,
            total_tasks: 10,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            progress: 0,
            created_at: Utc::now(),
            completed_at: None,
        };

        // Remaining daily quota is 5: the batch of 10 must enqueue nothing.
        let err = store.enqueue_batch(&batch, &tasks, &quotas).await.unwrap_err();
        assert_eq!(err.code(), "quota-exceeded-daily");
        assert_eq!(store.count_unfinished_tasks("u1").await.unwrap(), 0);
        assert!(store.get_batch(&batch_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let store = memory_store().await;
        let t = task("u1", "600000");
        store.enqueue_task(&t, &quotas()).await.unwrap();

        assert!(store.claim_task(&t.task_id, "worker-0").await.unwrap());
        // Second claim loses the race.
        assert!(!store.claim_task(&t.task_id, "worker-1").await.unwrap());

        let loaded = store.get_task(&t.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Processing);
        assert_eq!(loaded.worker_id.as_deref(), Some("worker-0"));
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let store = memory_store().await;
        let t = task("u1", "600000");
        store.enqueue_task(&t, &quotas()).await.unwrap();
        store.claim_task(&t.task_id, "w").await.unwrap();

        store.update_task_progress(&t.task_id, 40).await.unwrap();
        store.update_task_progress(&t.task_id, 20).await.unwrap();
        let loaded = store.get_task(&t.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 40);

        store.update_task_progress(&t.task_id, 90).await.unwrap();
        let loaded = store.get_task(&t.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, 90);
    }

    #[tokio::test]
    async fn completion_writes_result_and_full_progress() {
        let store = memory_store().await;
        let t = task("u1", "600000");
        store.enqueue_task(&t, &quotas()).await.unwrap();
        store.claim_task(&t.task_id, "w").await.unwrap();

        let outcome = AnalysisOutcome {
            summary: Some("hold".to_string()),
            confidence_score: Some(0.7),
            tokens_used: 1234,
            ..Default::default()
        };
        store.complete_task(&t.task_id, &outcome).await.unwrap();

        let loaded = store.get_task(&t.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.progress, 100);
        assert_eq!(loaded.result.unwrap().tokens_used, 1234);
    }

    #[tokio::test]
    async fn requeue_bumps_retry_count() {
        let store = memory_store().await;
        let t = task("u1", "600000");
        store.enqueue_task(&t, &quotas()).await.unwrap();
        store.claim_task(&t.task_id, "w").await.unwrap();
        store.requeue_task(&t.task_id, "upstream timeout").await.unwrap();

        let loaded = store.get_task(&t.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("upstream timeout"));
        assert!(loaded.worker_id.is_none());
    }

    #[tokio::test]
    async fn cancel_pending_unconditionally() {
        let store = memory_store().await;
        let t = task("u1", "600000");
        store.enqueue_task(&t, &quotas()).await.unwrap();
        assert!(store
            .mark_task_cancelled(&t.task_id, TaskStatus::Pending)
            .await
            .unwrap());
        // Cancelled task can no longer be claimed.
        assert!(!store.claim_task(&t.task_id, "w").await.unwrap());
    }

    #[tokio::test]
    async fn batch_status_derived_from_children() {
        let store = memory_store().await;
        let quotas = QuotaConfig {
            daily_quota: 100,
            concurrent_limit: 100,
        };
        let batch_id = Uuid::new_v4().to_string();
        let tasks: Vec<AnalysisTask> = (0..2)
            .map(|i| {
                let mut t = task("u1", &format!("60000{i}"));
                t.batch_id = Some(batch_id.clone());
                t
            })
            .collect();
        let batch = AnalysisBatch {
            batch_id: batch_id.clone(),
            user_id: "u1".to_string(),
            title: "pair".to_string(),
            status: BatchStatus::Pending,
            total_tasks: 2,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            progress: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        store.enqueue_batch(&batch, &tasks, &quotas).await.unwrap();

        store.claim_task(&tasks[0].task_id, "w").await.unwrap();
        store
            .complete_task(&tasks[0].task_id, &AnalysisOutcome::default())
            .await
            .unwrap();
        let recomputed = store.recompute_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(recomputed.status, BatchStatus::Processing);
        assert_eq!(recomputed.completed_tasks, 1);
        assert_eq!(recomputed.progress, 50);

        store.claim_task(&tasks[1].task_id, "w").await.unwrap();
        store.fail_task(&tasks[1].task_id, "boom").await.unwrap();
        let recomputed = store.recompute_batch(&batch_id).await.unwrap().unwrap();
        assert_eq!(recomputed.status, BatchStatus::PartialSuccess);
        assert!(recomputed.completed_at.is_some());
    }
}
