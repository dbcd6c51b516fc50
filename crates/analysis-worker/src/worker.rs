//! The worker pool: N workers pulling task ids FIFO, claiming by
//! compare-and-set, driving the analysis engine phase by phase.
//!
//! Each worker catches failures at exactly one boundary (one task):
//! retryable errors re-enqueue with bounded backoff, everything else
//! terminates that task alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use market_core::{AnalysisTask, TaskStatus};
use market_store::MarketStore;
use notification_service::{NotificationBus, NotificationKind, Severity};
use observability::Metrics;

use crate::engine::{AnalysisEngine, EngineError, PhaseReport};
use crate::queue::CancelRegistry;

#[derive(Clone)]
pub struct WorkerPoolSettings {
    pub workers: usize,
    /// Base of the retry backoff: delay = min(base * 2^retry_count, cap).
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Minimum spacing between progress writes.
    pub progress_interval: Duration,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_base: Duration::from_secs(60),
            retry_cap: Duration::from_secs(300),
            progress_interval: Duration::from_secs(1),
        }
    }
}

pub struct WorkerPool {
    store: MarketStore,
    engine: Arc<dyn AnalysisEngine>,
    notifier: Arc<NotificationBus>,
    metrics: Arc<Metrics>,
    cancels: CancelRegistry,
    requeue_tx: mpsc::UnboundedSender<String>,
    settings: WorkerPoolSettings,
}

impl WorkerPool {
    pub fn new(
        store: MarketStore,
        engine: Arc<dyn AnalysisEngine>,
        notifier: Arc<NotificationBus>,
        metrics: Arc<Metrics>,
        cancels: CancelRegistry,
        requeue_tx: mpsc::UnboundedSender<String>,
        settings: WorkerPoolSettings,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            metrics,
            cancels,
            requeue_tx,
            settings,
        }
    }

    /// Spawn the workers over one shared FIFO receiver.
    pub fn spawn(
        self: Arc<Self>,
        rx: mpsc::UnboundedReceiver<String>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.settings.workers);
        for index in 0..self.settings.workers {
            let pool = self.clone();
            let rx = rx.clone();
            let worker_id = format!("worker-{index}");
            handles.push(tokio::spawn(async move {
                loop {
                    let task_id = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(task_id) = task_id else {
                        // Queue dropped; the pool is shutting down.
                        break;
                    };
                    pool.process(&task_id, &worker_id).await;
                }
            }));
        }
        tracing::info!(workers = handles.len(), "[OK] worker pool started");
        handles
    }

    async fn process(&self, task_id: &str, worker_id: &str) {
        // Register the cancel flag before the claim so any cancel that
        // observes the processing state can reach it.
        let flag = Arc::new(AtomicBool::new(false));
        self.cancels.insert(task_id.to_string(), flag.clone());

        if !matches!(self.store.claim_task(task_id, worker_id).await, Ok(true)) {
            // Lost the claim race or the task was cancelled while queued.
            self.cancels.remove(task_id);
            return;
        }
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            _ => {
                self.cancels.remove(task_id);
                return;
            }
        };

        let started = Instant::now();

        let result = self.run_task(&task, &flag).await;
        self.cancels.remove(task_id);
        self.metrics
            .record("worker.task", started.elapsed(), result.is_ok());

        if let Err(e) = result {
            tracing::error!(task_id, error = %e, "[FAIL] task processing error");
        }

        if let Some(batch_id) = &task.batch_id {
            let _ = self.store.recompute_batch(batch_id).await;
        }
    }

    async fn run_task(
        &self,
        task: &AnalysisTask,
        cancel: &Arc<AtomicBool>,
    ) -> Result<TaskEnd, market_core::StoreError> {
        let phases = self.engine.phases(&task.parameters);
        let total = phases.len().max(1);
        let mut reports: Vec<PhaseReport> = Vec::with_capacity(total);
        let mut last_progress_write: Option<Instant> = None;
        let started = Instant::now();

        for (index, phase) in phases.iter().enumerate() {
            // Cooperative cancellation between analyst phases.
            if cancel.load(Ordering::SeqCst) {
                return self.finish_cancelled(task).await;
            }

            match self.engine.run_phase(phase, task).await {
                Ok(report) => {
                    if report.tokens_in + report.tokens_out > 0 {
                        self.metrics.record_tokens(
                            report.tokens_in,
                            report.tokens_out,
                            started.elapsed(),
                        );
                    }
                    reports.push(report);
                }
                Err(EngineError::Retryable(message)) if task.retry_count < task.max_retries => {
                    return self.finish_requeued(task, &message).await;
                }
                Err(e) => {
                    return self.finish_failed(task, &e.to_string()).await;
                }
            }

            // Monotonic progress, throttled to one write per interval.
            let progress = (((index + 1) * 100) / total).min(99) as u8;
            let due = last_progress_write
                .map(|at| at.elapsed() >= self.settings.progress_interval)
                .unwrap_or(true);
            if due {
                self.store
                    .update_task_progress(&task.task_id, progress)
                    .await?;
                last_progress_write = Some(Instant::now());
            }
        }

        if cancel.load(Ordering::SeqCst) {
            return self.finish_cancelled(task).await;
        }

        let mut outcome = match self.engine.synthesize(task, &reports).await {
            Ok(outcome) => outcome,
            Err(EngineError::Retryable(message)) if task.retry_count < task.max_retries => {
                return self.finish_requeued(task, &message).await;
            }
            Err(e) => return self.finish_failed(task, &e.to_string()).await,
        };
        outcome.execution_time_secs = started.elapsed().as_secs_f64();

        self.store.complete_task(&task.task_id, &outcome).await?;
        let _ = self
            .notifier
            .publish(
                &task.user_id,
                NotificationKind::Analysis,
                Severity::Info,
                "analysis completed",
                Some(format!("{} analysis finished", task.symbol)),
                Some(format!("/analysis/task/{}", task.task_id)),
                None,
            )
            .await;
        tracing::info!(task_id = task.task_id.as_str(), "[OK] task completed");
        Ok(TaskEnd::Completed)
    }

    async fn finish_cancelled(
        &self,
        task: &AnalysisTask,
    ) -> Result<TaskEnd, market_core::StoreError> {
        self.store
            .mark_task_cancelled(&task.task_id, TaskStatus::Processing)
            .await?;
        let _ = self
            .notifier
            .publish(
                &task.user_id,
                NotificationKind::Analysis,
                Severity::Warn,
                "analysis cancelled",
                Some(format!("{} stopped on request", task.symbol)),
                None,
                None,
            )
            .await;
        tracing::info!(task_id = task.task_id.as_str(), "task cancelled");
        Ok(TaskEnd::Cancelled)
    }

    async fn finish_failed(
        &self,
        task: &AnalysisTask,
        error: &str,
    ) -> Result<TaskEnd, market_core::StoreError> {
        self.store.fail_task(&task.task_id, error).await?;
        let _ = self
            .notifier
            .publish(
                &task.user_id,
                NotificationKind::Analysis,
                Severity::Error,
                "analysis failed",
                Some(format!("{}: {error}", task.symbol)),
                None,
                None,
            )
            .await;
        tracing::warn!(task_id = task.task_id.as_str(), error, "[WARN] task failed");
        Ok(TaskEnd::Failed)
    }

    async fn finish_requeued(
        &self,
        task: &AnalysisTask,
        error: &str,
    ) -> Result<TaskEnd, market_core::StoreError> {
        self.store.requeue_task(&task.task_id, error).await?;
        let delay = self
            .settings
            .retry_base
            .saturating_mul(1u32 << task.retry_count.min(16))
            .min(self.settings.retry_cap);
        let tx = self.requeue_tx.clone();
        let task_id = task.task_id.to_string();
        tracing::info!(
            task_id = task_id.as_str(),
            retry = task.retry_count + 1,
            delay_secs = delay.as_secs(),
            "[WARN] task re-enqueued with backoff"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(task_id);
        });
        Ok(TaskEnd::Requeued)
    }
}

enum TaskEnd {
    Completed,
    Failed,
    Cancelled,
    Requeued,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AnalysisEngine, EngineError, PhaseReport};
    use crate::queue::TaskQueue;
    use async_trait::async_trait;
    use market_core::config::QuotaConfig;
    use market_core::{AnalysisOutcome, AnalysisParameters};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Engine whose behavior is programmable per test.
    struct TestEngine {
        /// Fail this many phase calls with a retryable error first.
        retryable_failures: AtomicU32,
        fatal: bool,
        phase_delay: Duration,
        phase_count: usize,
    }

    impl Default for TestEngine {
        fn default() -> Self {
            Self {
                retryable_failures: AtomicU32::new(0),
                fatal: false,
                phase_delay: Duration::ZERO,
                phase_count: 3,
            }
        }
    }

    #[async_trait]
    impl AnalysisEngine for TestEngine {
        fn phases(&self, _parameters: &AnalysisParameters) -> Vec<String> {
            (0..self.phase_count).map(|i| format!("phase-{i}")).collect()
        }

        async fn run_phase(
            &self,
            phase: &str,
            _task: &AnalysisTask,
        ) -> Result<PhaseReport, EngineError> {
            if self.fatal {
                return Err(EngineError::Fatal("model rejected input".to_string()));
            }
            if self
                .retryable_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::Retryable("llm rate limited".to_string()));
            }
            if !self.phase_delay.is_zero() {
                tokio::time::sleep(self.phase_delay).await;
            }
            Ok(PhaseReport {
                phase: phase.to_string(),
                output: json!({"ok": true}),
                tokens_in: 100,
                tokens_out: 20,
            })
        }

        async fn synthesize(
            &self,
            _task: &AnalysisTask,
            reports: &[PhaseReport],
        ) -> Result<AnalysisOutcome, EngineError> {
            Ok(AnalysisOutcome {
                summary: Some(format!("{} phases", reports.len())),
                ..Default::default()
            })
        }
    }

    struct Harness {
        store: MarketStore,
        queue: TaskQueue,
        _handles: Vec<JoinHandle<()>>,
    }

    async fn harness(engine: TestEngine, workers: usize) -> Harness {
        let store = MarketStore::new("sqlite::memory:").await.unwrap();
        let notifier = Arc::new(NotificationBus::new(store.clone()));
        let quotas = QuotaConfig {
            daily_quota: 1000,
            concurrent_limit: 100,
        };
        let (queue, rx) = TaskQueue::new(store.clone(), notifier.clone(), quotas, 3);
        let settings = WorkerPoolSettings {
            workers,
            retry_base: Duration::from_millis(10),
            retry_cap: Duration::from_millis(50),
            progress_interval: Duration::from_millis(1),
        };
        let pool = Arc::new(WorkerPool::new(
            store.clone(),
            Arc::new(engine),
            notifier,
            Arc::new(Metrics::new()),
            queue.cancel_registry(),
            queue.sender(),
            settings,
        ));
        let handles = pool.spawn(rx);
        Harness {
            store,
            queue,
            _handles: handles,
        }
    }

    async fn wait_for_status(
        store: &MarketStore,
        task_id: &str,
        wanted: TaskStatus,
    ) -> AnalysisTask {
        for _ in 0..200 {
            if let Ok(Some(task)) = store.get_task(task_id).await {
                if task.status == wanted {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached {wanted:?}");
    }

    #[tokio::test]
    async fn task_flows_to_completed_with_notification() {
        let h = harness(TestEngine::default(), 2).await;
        let task = h.queue.submit_single("u1", "600000", None).await.unwrap();

        let done = wait_for_status(&h.store, &task.task_id, TaskStatus::Completed).await;
        assert_eq!(done.progress, 100);
        assert!(done.result.is_some());
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());

        // task-created plus completion notification.
        let unread = h.store.unread_notification_count("u1").await.unwrap();
        assert_eq!(unread, 2);
    }

    #[tokio::test]
    async fn retryable_errors_requeue_then_succeed() {
        let engine = TestEngine {
            retryable_failures: AtomicU32::new(2),
            ..Default::default()
        };
        let h = harness(engine, 1).await;
        let task = h.queue.submit_single("u1", "600000", None).await.unwrap();

        let done = wait_for_status(&h.store, &task.task_id, TaskStatus::Completed).await;
        assert_eq!(done.retry_count, 2);
        assert_eq!(done.last_error.as_deref(), Some("llm rate limited"));
    }

    #[tokio::test]
    async fn fatal_error_fails_once_without_retry() {
        let engine = TestEngine {
            fatal: true,
            ..Default::default()
        };
        let h = harness(engine, 1).await;
        let task = h.queue.submit_single("u1", "600000", None).await.unwrap();

        let done = wait_for_status(&h.store, &task.task_id, TaskStatus::Failed).await;
        assert_eq!(done.retry_count, 0);
        assert!(done.last_error.unwrap().contains("model rejected"));
    }

    #[tokio::test]
    async fn processing_task_cancels_between_phases() {
        let engine = TestEngine {
            phase_delay: Duration::from_millis(50),
            phase_count: 20,
            ..Default::default()
        };
        let h = harness(engine, 1).await;
        let task = h.queue.submit_single("u1", "600000", None).await.unwrap();

        // Wait until a worker picked it up, then cancel cooperatively.
        wait_for_status(&h.store, &task.task_id, TaskStatus::Processing).await;
        let outcome = h.queue.cancel("u1", &task.task_id).await.unwrap();
        assert_eq!(outcome, crate::queue::CancelOutcome::CancelRequested);

        let done = wait_for_status(&h.store, &task.task_id, TaskStatus::Cancelled).await;
        assert!(done.result.is_none());
        assert!(done.progress < 100);
    }

    #[tokio::test]
    async fn pending_task_cancels_immediately_when_no_worker_runs() {
        let store = MarketStore::new("sqlite::memory:").await.unwrap();
        let notifier = Arc::new(NotificationBus::new(store.clone()));
        let quotas = QuotaConfig {
            daily_quota: 10,
            concurrent_limit: 10,
        };
        // No worker pool spawned: the task stays pending.
        let (queue, _rx) = TaskQueue::new(store.clone(), notifier, quotas, 3);
        let task = queue.submit_single("u1", "600000", None).await.unwrap();

        let outcome = queue.cancel("u1", &task.task_id).await.unwrap();
        assert_eq!(outcome, crate::queue::CancelOutcome::Cancelled);
        let loaded = store.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn batch_terminal_status_recomputes_from_children() {
        let h = harness(TestEngine::default(), 2).await;
        let (batch, tasks) = h
            .queue
            .submit_batch(
                "u1",
                "two stocks",
                &["600000".to_string(), "000001".to_string()],
                None,
            )
            .await
            .unwrap();

        for task in &tasks {
            wait_for_status(&h.store, &task.task_id, TaskStatus::Completed).await;
        }
        // The pool recomputes after each terminal child.
        for _ in 0..100 {
            let loaded = h.store.get_batch(&batch.batch_id).await.unwrap().unwrap();
            if loaded.status == market_core::BatchStatus::Completed {
                assert_eq!(loaded.progress, 100);
                assert_eq!(loaded.completed_tasks, 2);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch never completed");
    }

    #[tokio::test]
    async fn eleven_symbol_batch_is_rejected() {
        let h = harness(TestEngine::default(), 1).await;
        let symbols: Vec<String> = (0..11).map(|i| format!("6000{i:02}")).collect();
        let err = h
            .queue
            .submit_batch("u1", "too big", &symbols, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad-request");

        let ten: Vec<String> = (0..10).map(|i| format!("6000{i:02}")).collect();
        assert!(h.queue.submit_batch("u1", "ok", &ten, None).await.is_ok());
    }
}
