//! Operation counters, timers, slow-call log, and LLM token usage.
//!
//! Timing is explicit at call sites: wrap the operation with
//! [`Metrics::observe`] (or record manually with `record`). Anything over
//! one second lands in the slow-call ring; the last 100 are retained.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SLOW_THRESHOLD: Duration = Duration::from_secs(1);
const SLOW_RETAINED: usize = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct OpStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: f64,
}

impl OpStats {
    fn record(&mut self, elapsed: Duration, success: bool) {
        let ms = elapsed.as_millis() as u64;
        let total = self.success_count + self.failure_count;
        self.avg_ms = (self.avg_ms * total as f64 + ms as f64) / (total + 1) as f64;
        if total == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowCall {
    pub name: String,
    pub elapsed_ms: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsage {
    pub calls: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_elapsed_secs: f64,
}

#[derive(Default)]
struct Inner {
    ops: HashMap<String, OpStats>,
    slow: VecDeque<SlowCall>,
    tokens: TokenUsage,
}

#[derive(Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub operations: HashMap<String, OpStats>,
    pub slow_calls: Vec<SlowCall>,
    pub token_usage: TokenUsage,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &str, elapsed: Duration, success: bool) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner
            .ops
            .entry(name.to_string())
            .or_default()
            .record(elapsed, success);

        if elapsed >= SLOW_THRESHOLD {
            inner.slow.push_back(SlowCall {
                name: name.to_string(),
                elapsed_ms: elapsed.as_millis() as u64,
                at: Utc::now(),
            });
            if inner.slow.len() > SLOW_RETAINED {
                inner.slow.pop_front();
            }
            tracing::warn!(
                op = name,
                elapsed_ms = elapsed.as_millis() as u64,
                "[WARN] slow operation"
            );
        }
    }

    /// Time one async operation and record its outcome.
    pub async fn observe<T, E, Fut>(&self, name: &str, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = fut.await;
        self.record(name, started.elapsed(), result.is_ok());
        result
    }

    pub fn record_tokens(&self, tokens_in: u64, tokens_out: u64, elapsed: Duration) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.tokens.calls += 1;
        inner.tokens.tokens_in += tokens_in;
        inner.tokens.tokens_out += tokens_out;
        inner.tokens.total_elapsed_secs += elapsed.as_secs_f64();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        MetricsSnapshot {
            operations: inner.ops.clone(),
            slow_calls: inner.slow.iter().cloned().collect(),
            token_usage: inner.tokens.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_bounds_track_outcomes() {
        let metrics = Metrics::new();
        metrics.record("sync.basics", Duration::from_millis(120), true);
        metrics.record("sync.basics", Duration::from_millis(80), true);
        metrics.record("sync.basics", Duration::from_millis(400), false);

        let snap = metrics.snapshot();
        let stats = &snap.operations["sync.basics"];
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.min_ms, 80);
        assert_eq!(stats.max_ms, 400);
        assert!((stats.avg_ms - 200.0).abs() < 1.0);
    }

    #[test]
    fn slow_ring_is_bounded() {
        let metrics = Metrics::new();
        for i in 0..(SLOW_RETAINED + 20) {
            metrics.record(&format!("op{i}"), Duration::from_millis(1500), true);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.slow_calls.len(), SLOW_RETAINED);
        assert_eq!(snap.slow_calls.last().unwrap().name, "op119");
    }

    #[test]
    fn sub_second_calls_stay_out_of_slow_log() {
        let metrics = Metrics::new();
        metrics.record("fast", Duration::from_millis(900), true);
        assert!(metrics.snapshot().slow_calls.is_empty());
    }

    #[test]
    fn token_usage_accumulates() {
        let metrics = Metrics::new();
        metrics.record_tokens(1000, 250, Duration::from_secs(3));
        metrics.record_tokens(2000, 400, Duration::from_secs(5));
        let usage = metrics.snapshot().token_usage;
        assert_eq!(usage.calls, 2);
        assert_eq!(usage.tokens_in, 3000);
        assert_eq!(usage.tokens_out, 650);
        assert!((usage.total_elapsed_secs - 8.0).abs() < 1e-9);
    }
}
