//! Task submission: quota gates, batch atomicity, cancellation entry
//! points, and the FIFO handoff to the worker pool.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use market_core::config::QuotaConfig;
use market_core::{
    AnalysisBatch, AnalysisParameters, AnalysisTask, BatchStatus, QueueError, TaskStatus,
    MAX_BATCH_TASKS,
};
use market_store::MarketStore;
use notification_service::{NotificationBus, NotificationKind, Severity};

/// Cancel flags for tasks currently being processed; workers check these
/// between analyst phases.
pub type CancelRegistry = Arc<DashMap<String, Arc<std::sync::atomic::AtomicBool>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Pending task cancelled immediately.
    Cancelled,
    /// Processing task: the worker will stop at the next phase boundary.
    CancelRequested,
}

pub struct TaskQueue {
    store: MarketStore,
    notifier: Arc<NotificationBus>,
    quotas: QuotaConfig,
    default_max_retries: u32,
    tx: mpsc::UnboundedSender<String>,
    cancels: CancelRegistry,
}

impl TaskQueue {
    pub fn new(
        store: MarketStore,
        notifier: Arc<NotificationBus>,
        quotas: QuotaConfig,
        default_max_retries: u32,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                notifier,
                quotas,
                default_max_retries,
                tx,
                cancels: Arc::new(DashMap::new()),
            },
            rx,
        )
    }

    pub fn cancel_registry(&self) -> CancelRegistry {
        self.cancels.clone()
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.tx.clone()
    }

    pub async fn submit_single(
        &self,
        user_id: &str,
        symbol: &str,
        parameters: Option<AnalysisParameters>,
    ) -> Result<AnalysisTask, QueueError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(QueueError::BadRequest("symbol is required".to_string()));
        }

        let task = AnalysisTask::new(
            user_id,
            symbol,
            parameters.unwrap_or_default(),
            self.default_max_retries,
        );
        self.store.enqueue_task(&task, &self.quotas).await?;

        let _ = self
            .notifier
            .publish(
                user_id,
                NotificationKind::Analysis,
                Severity::Info,
                "analysis task created",
                Some(format!("{symbol} queued for analysis")),
                Some(format!("/analysis/task/{}", task.task_id)),
                None,
            )
            .await;

        // A send failure means the pool is gone; the task stays pending
        // and is picked up on restart.
        let _ = self.tx.send(task.task_id.clone());
        tracing::info!(task_id = task.task_id.as_str(), symbol, "task enqueued");
        Ok(task)
    }

    /// Submit up to `MAX_BATCH_TASKS` symbols atomically: either every
    /// child is enqueued or none is.
    pub async fn submit_batch(
        &self,
        user_id: &str,
        title: &str,
        symbols: &[String],
        parameters: Option<AnalysisParameters>,
    ) -> Result<(AnalysisBatch, Vec<AnalysisTask>), QueueError> {
        if symbols.is_empty() {
            return Err(QueueError::BadRequest("no symbols given".to_string()));
        }
        if symbols.len() > MAX_BATCH_TASKS {
            return Err(QueueError::BadRequest(format!(
                "batch holds {} symbols; the maximum is {MAX_BATCH_TASKS}",
                symbols.len()
            )));
        }

        let parameters = parameters.unwrap_or_default();
        let batch_id = Uuid::new_v4().to_string();
        let tasks: Vec<AnalysisTask> = symbols
            .iter()
            .map(|symbol| {
                let mut task = AnalysisTask::new(
                    user_id,
                    symbol.trim(),
                    parameters.clone(),
                    self.default_max_retries,
                );
                task.batch_id = Some(batch_id.clone());
                task
            })
            .collect();
        if tasks.iter().any(|t| t.symbol.is_empty()) {
            return Err(QueueError::BadRequest("empty symbol in batch".to_string()));
        }

        let batch = AnalysisBatch {
            batch_id: batch_id.clone(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            status: BatchStatus::Pending,
            total_tasks: tasks.len() as i64,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            progress: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.store.enqueue_batch(&batch, &tasks, &self.quotas).await?;

        let _ = self
            .notifier
            .publish(
                user_id,
                NotificationKind::Analysis,
                Severity::Info,
                "analysis batch created",
                Some(format!("{} tasks queued", tasks.len())),
                Some(format!("/analysis/batch/{batch_id}")),
                None,
            )
            .await;

        for task in &tasks {
            let _ = self.tx.send(task.task_id.clone());
        }
        tracing::info!(batch_id = batch_id.as_str(), tasks = tasks.len(), "batch enqueued");
        Ok((batch, tasks))
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<AnalysisTask>, QueueError> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<AnalysisBatch>, QueueError> {
        Ok(self.store.get_batch(batch_id).await?)
    }

    /// Cancel a task owned by `user_id`. Pending tasks stop immediately;
    /// processing tasks stop cooperatively at the next analyst phase.
    pub async fn cancel(&self, user_id: &str, task_id: &str) -> Result<CancelOutcome, QueueError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("task {task_id}")))?;
        if task.user_id != user_id {
            return Err(QueueError::NotFound(format!("task {task_id}")));
        }

        match task.status {
            TaskStatus::Pending => {
                if !self
                    .store
                    .mark_task_cancelled(task_id, TaskStatus::Pending)
                    .await?
                {
                    // Raced with a worker claim; fall back to cooperative.
                    return self.request_processing_cancel(&task).await;
                }
                if let Some(batch_id) = &task.batch_id {
                    let _ = self.store.recompute_batch(batch_id).await;
                }
                let _ = self
                    .notifier
                    .publish(
                        user_id,
                        NotificationKind::Analysis,
                        Severity::Info,
                        "analysis task cancelled",
                        Some(format!("{} cancelled before start", task.symbol)),
                        None,
                        None,
                    )
                    .await;
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Processing => self.request_processing_cancel(&task).await,
            status => Err(QueueError::BadRequest(format!(
                "task is already {}",
                status.as_str()
            ))),
        }
    }

    async fn request_processing_cancel(
        &self,
        task: &AnalysisTask,
    ) -> Result<CancelOutcome, QueueError> {
        if let Some(flag) = self.cancels.get(&task.task_id) {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(CancelOutcome::CancelRequested)
        } else {
            // Worker not yet registered; mark the row directly.
            self.store
                .mark_task_cancelled(&task.task_id, TaskStatus::Processing)
                .await?;
            Ok(CancelOutcome::Cancelled)
        }
    }
}
