//! Per-provider health tracking.
//!
//! One background loop probes every registered provider each tick and
//! updates a mutex-protected metrics map. Adapter calls made by the router
//! also feed the same map, so the picture reflects real traffic between
//! probes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use market_core::config::HealthMonitorConfig;

use crate::MarketDataProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Healthy,
    Degraded,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthMetrics {
    pub status: SourceStatus,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_response_time_secs: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Rolling window of the most recent error messages (<= 10).
    pub error_messages: Vec<String>,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            status: SourceStatus::Unknown,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            avg_response_time_secs: 0.0,
            last_success: None,
            last_failure: None,
            error_messages: Vec::new(),
        }
    }
}

const MAX_ERROR_MESSAGES: usize = 10;

pub struct HealthMonitor {
    metrics: Mutex<HashMap<String, HealthMetrics>>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn record_success(&self, source: &str, response_time: Duration) {
        let secs = response_time.as_secs_f64();
        // A slow answer is a failure no matter what it contained.
        if secs > self.config.response_time_threshold_secs as f64 {
            self.record_failure(source, &format!("response took {secs:.1}s"), response_time);
            return;
        }

        let mut map = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let metrics = map.entry(source.to_string()).or_default();
        metrics.success_count += 1;
        metrics.consecutive_failures = 0;
        metrics.last_success = Some(Utc::now());
        metrics.avg_response_time_secs = if metrics.avg_response_time_secs == 0.0 {
            secs
        } else {
            (metrics.avg_response_time_secs + secs) / 2.0
        };
        metrics.status = if metrics.failure_count == 0 {
            SourceStatus::Healthy
        } else {
            SourceStatus::Degraded
        };
    }

    pub fn record_failure(&self, source: &str, error: &str, response_time: Duration) {
        let mut map = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let metrics = map.entry(source.to_string()).or_default();
        metrics.failure_count += 1;
        metrics.consecutive_failures += 1;
        metrics.last_failure = Some(Utc::now());
        metrics.avg_response_time_secs = if metrics.avg_response_time_secs == 0.0 {
            response_time.as_secs_f64()
        } else {
            (metrics.avg_response_time_secs + response_time.as_secs_f64()) / 2.0
        };

        metrics
            .error_messages
            .push(format!("{}: {error}", Utc::now().format("%H:%M:%S")));
        if metrics.error_messages.len() > MAX_ERROR_MESSAGES {
            metrics.error_messages.remove(0);
        }

        metrics.status = if metrics.consecutive_failures >= self.config.failure_threshold {
            SourceStatus::Unavailable
        } else {
            SourceStatus::Degraded
        };
    }

    pub fn status(&self, source: &str) -> SourceStatus {
        let map = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(source)
            .map(|m| m.status)
            .unwrap_or(SourceStatus::Unknown)
    }

    pub fn unhealthy(&self) -> Vec<String> {
        let map = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.iter()
            .filter(|(_, m)| m.status != SourceStatus::Healthy)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> HashMap<String, HealthMetrics> {
        let map = match self.metrics.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.clone()
    }

    /// One probe per provider. A probe is the cheapest call every adapter
    /// answers: the latest trade date.
    pub async fn probe_all(&self, providers: &[Arc<dyn MarketDataProvider>]) {
        for provider in providers {
            let started = std::time::Instant::now();
            match provider.latest_trade_date().await {
                Ok(_) => {
                    self.record_success(provider.name(), started.elapsed());
                    tracing::debug!(source = provider.name(), "[OK] health probe passed");
                }
                Err(e) if e.counts_as_failure() => {
                    self.record_failure(provider.name(), &e.to_string(), started.elapsed());
                    tracing::debug!(source = provider.name(), error = %e, "[WARN] health probe failed");
                }
                Err(_) => {
                    // Unsupported probes still prove the adapter is wired up.
                    self.record_success(provider.name(), started.elapsed());
                }
            }
        }
        self.log_report();
    }

    /// Background loop; one tick every `tick_secs`.
    pub async fn run(self: Arc<Self>, providers: Vec<Arc<dyn MarketDataProvider>>) {
        let tick = Duration::from_secs(self.config.tick_secs);
        tracing::info!(
            tick_secs = self.config.tick_secs,
            providers = providers.len(),
            "[OK] health monitor started"
        );
        loop {
            self.probe_all(&providers).await;
            tokio::time::sleep(tick).await;
        }
    }

    fn log_report(&self) {
        let snapshot = self.snapshot();
        for (name, m) in &snapshot {
            let total = m.success_count + m.failure_count;
            let success_rate = if total > 0 {
                m.success_count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            tracing::info!(
                source = name.as_str(),
                status = ?m.status,
                success_rate = format!("{success_rate:.1}%"),
                avg_response_secs = format!("{:.2}", m.avg_response_time_secs),
                consecutive_failures = m.consecutive_failures,
                "health report"
            );
        }
    }
}
