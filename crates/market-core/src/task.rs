use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Legal transitions form a DAG; the only back-edge is
    /// processing -> pending on retry.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Pending)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::PartialSuccess => "partial_success",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s {
            "pending" => Some(BatchStatus::Pending),
            "processing" => Some(BatchStatus::Processing),
            "completed" => Some(BatchStatus::Completed),
            "partial_success" => Some(BatchStatus::PartialSuccess),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }
}

/// Submission parameters carried by every analysis task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisParameters {
    #[serde(default = "default_market_type")]
    pub market_type: String,
    /// 1 (quick) to 5 (comprehensive).
    #[serde(default = "default_depth")]
    pub research_depth: u8,
    #[serde(default = "default_analysts")]
    pub selected_analysts: Vec<String>,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_market_type() -> String {
    "cn".to_string()
}

fn default_depth() -> u8 {
    3
}

fn default_analysts() -> Vec<String> {
    vec![
        "market".to_string(),
        "fundamentals".to_string(),
        "news".to_string(),
        "sentiment".to_string(),
    ]
}

fn default_language() -> String {
    "zh-CN".to_string()
}

impl Default for AnalysisParameters {
    fn default() -> Self {
        Self {
            market_type: default_market_type(),
            research_depth: default_depth(),
            selected_analysts: default_analysts(),
            custom_prompt: None,
            language: default_language(),
        }
    }
}

/// Final output of a completed analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub summary: Option<String>,
    pub recommendation: Option<String>,
    pub confidence_score: Option<f64>,
    pub risk_level: Option<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub detailed_analysis: Option<serde_json::Value>,
    pub tokens_used: u64,
    pub execution_time_secs: f64,
    pub model_info: Option<String>,
}

/// One analysis unit submitted by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub task_id: String,
    pub batch_id: Option<String>,
    pub user_id: String,
    pub symbol: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub parameters: AnalysisParameters,
    pub result: Option<AnalysisOutcome>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
}

impl AnalysisTask {
    pub fn new(
        user_id: &str,
        symbol: &str,
        parameters: AnalysisParameters,
        max_retries: u32,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            batch_id: None,
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
            parameters,
            result: None,
            retry_count: 0,
            max_retries,
            last_error: None,
        }
    }
}

/// An atomic group of up to 10 tasks; progress and terminal status are
/// derived from the children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisBatch {
    pub batch_id: String,
    pub user_id: String,
    pub title: String,
    pub status: BatchStatus,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub cancelled_tasks: i64,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const MAX_BATCH_TASKS: usize = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_dag_has_single_back_edge() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Cancelled));
        // The retry back-edge.
        assert!(Processing.can_transition_to(Pending));
        // No escapes from terminal states.
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        // No pending -> terminal shortcuts other than cancel.
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn new_task_starts_pending_at_zero() {
        let task = AnalysisTask::new("u1", "600000", AnalysisParameters::default(), 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 0);
        assert!(task.batch_id.is_none());
    }
}
