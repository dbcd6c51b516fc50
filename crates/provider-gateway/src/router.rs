//! Source routing with priority-ordered fallback.
//!
//! Order is decided per request: configured priority, filtered by
//! `enabled`, with currently-unavailable providers pushed to the back
//! (dropped entirely when `strict`). The registry can be hot-reloaded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use market_core::config::ProviderConfig;
use market_core::{ProviderError, ProviderKind};

use crate::health::{HealthMonitor, SourceStatus};
use crate::MarketDataProvider;

/// A successful fallback call: the value plus the provider that served it.
pub struct FallbackOutcome<T> {
    pub value: T,
    pub source: String,
}

pub struct SourceRouter {
    registry: RwLock<Vec<ProviderConfig>>,
    adapters: HashMap<String, Arc<dyn MarketDataProvider>>,
    health: Arc<HealthMonitor>,
}

impl SourceRouter {
    pub fn new(
        configs: Vec<ProviderConfig>,
        adapters: HashMap<String, Arc<dyn MarketDataProvider>>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            registry: RwLock::new(configs),
            adapters,
            health,
        }
    }

    /// Replace the provider registry (priority/enabled hot-reload).
    pub async fn reload(&self, configs: Vec<ProviderConfig>) {
        let mut registry = self.registry.write().await;
        *registry = configs;
        tracing::info!(providers = registry.len(), "[OK] provider registry reloaded");
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn MarketDataProvider>> {
        self.adapters.get(name).cloned()
    }

    pub fn adapters(&self) -> Vec<Arc<dyn MarketDataProvider>> {
        self.adapters.values().cloned().collect()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Ordered provider names for one request class.
    pub async fn route(&self, kind: ProviderKind, strict: bool) -> Vec<String> {
        let registry = self.registry.read().await;
        let mut eligible: Vec<&ProviderConfig> = registry
            .iter()
            .filter(|p| p.enabled && p.kind == kind && self.adapters.contains_key(&p.name))
            .collect();
        eligible.sort_by_key(|p| p.priority);

        let mut available = Vec::new();
        let mut unavailable = Vec::new();
        for provider in eligible {
            if self.health.status(&provider.name) == SourceStatus::Unavailable {
                unavailable.push(provider.name.clone());
            } else {
                available.push(provider.name.clone());
            }
        }
        if !strict {
            // Unavailable providers are tried last, not skipped.
            available.extend(unavailable);
        }
        available
    }

    /// Invoke providers in routed order until one answers. Transient,
    /// rate-limited, unsupported, and not-found responses advance to the
    /// next provider; every real failure feeds the health metrics.
    pub async fn call_with_fallback<T, F, Fut>(
        &self,
        kind: ProviderKind,
        strict: bool,
        op_name: &str,
        op: F,
    ) -> Result<FallbackOutcome<T>, ProviderError>
    where
        F: Fn(Arc<dyn MarketDataProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let order = self.route(kind, strict).await;
        if order.is_empty() {
            return Err(ProviderError::Permanent(format!(
                "no enabled provider for {}",
                kind.as_str()
            )));
        }

        let mut saw_not_found = false;
        let mut last_err: Option<ProviderError> = None;

        for name in order {
            let adapter = match self.adapters.get(&name) {
                Some(a) => a.clone(),
                None => continue,
            };
            let started = Instant::now();
            match op(adapter).await {
                Ok(value) => {
                    self.health.record_success(&name, started.elapsed());
                    return Ok(FallbackOutcome {
                        value,
                        source: name,
                    });
                }
                Err(e) => {
                    if e.counts_as_failure() {
                        self.health
                            .record_failure(&name, &e.to_string(), started.elapsed());
                        tracing::warn!(
                            op = op_name,
                            source = name.as_str(),
                            error = %e,
                            "[WARN] provider failed, trying next"
                        );
                    } else {
                        tracing::debug!(
                            op = op_name,
                            source = name.as_str(),
                            error = %e,
                            "provider declined, trying next"
                        );
                    }
                    if matches!(e, ProviderError::NotFound) {
                        saw_not_found = true;
                    } else {
                        last_err = Some(e);
                    }
                }
            }
        }

        if saw_not_found && last_err.is_none() {
            Err(ProviderError::NotFound)
        } else {
            Err(last_err
                .unwrap_or_else(|| ProviderError::Transient("all providers failed".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use market_core::config::HealthMonitorConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubProvider {
        name: &'static str,
        fail: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MarketDataProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn latest_trade_date(&self) -> Result<chrono::NaiveDate, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError::Transient("stub down".to_string()))
            } else {
                Ok(chrono::NaiveDate::from_ymd_opt(2025, 11, 5).unwrap())
            }
        }
    }

    fn config(name: &str, priority: i32) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: ProviderKind::CnEquity,
            enabled: true,
            priority,
            credentials_ref: None,
        }
    }

    fn router_with(stubs: Vec<Arc<StubProvider>>, configs: Vec<ProviderConfig>) -> SourceRouter {
        let health = Arc::new(HealthMonitor::new(HealthMonitorConfig {
            tick_secs: 300,
            failure_threshold: 3,
            response_time_threshold_secs: 30,
        }));
        let adapters: HashMap<String, Arc<dyn MarketDataProvider>> = stubs
            .into_iter()
            .map(|s| (s.name.to_string(), s as Arc<dyn MarketDataProvider>))
            .collect();
        SourceRouter::new(configs, adapters, health)
    }

    #[tokio::test]
    async fn fallback_advances_past_failing_primary() {
        let primary = Arc::new(StubProvider {
            name: "a",
            fail: true,
            calls: AtomicU32::new(0),
        });
        let secondary = Arc::new(StubProvider {
            name: "b",
            fail: false,
            calls: AtomicU32::new(0),
        });
        let router = router_with(
            vec![primary.clone(), secondary.clone()],
            vec![config("a", 1), config("b", 2)],
        );

        let outcome = router
            .call_with_fallback(ProviderKind::CnEquity, false, "latest_trade_date", |p| async move {
                p.latest_trade_date().await
            })
            .await
            .unwrap();

        assert_eq!(outcome.source, "b");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 1);
        // The failure was recorded against the primary.
        let snap = router.health().snapshot();
        assert_eq!(snap["a"].failure_count, 1);
        assert_eq!(snap["b"].success_count, 1);
    }

    #[tokio::test]
    async fn unavailable_provider_is_routed_last_then_recovers() {
        let a = Arc::new(StubProvider {
            name: "a",
            fail: false,
            calls: AtomicU32::new(0),
        });
        let b = Arc::new(StubProvider {
            name: "b",
            fail: false,
            calls: AtomicU32::new(0),
        });
        let router = router_with(vec![a, b], vec![config("a", 1), config("b", 2)]);

        for _ in 0..3 {
            router
                .health()
                .record_failure("a", "probe failed", Duration::from_secs(1));
        }
        assert_eq!(router.route(ProviderKind::CnEquity, false).await, vec!["b", "a"]);
        // strict drops it entirely.
        assert_eq!(router.route(ProviderKind::CnEquity, true).await, vec!["b"]);

        // One successful probe restores eligibility.
        router.health().record_success("a", Duration::from_secs(1));
        assert_eq!(router.route(ProviderKind::CnEquity, false).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn disabled_providers_are_filtered() {
        let a = Arc::new(StubProvider {
            name: "a",
            fail: false,
            calls: AtomicU32::new(0),
        });
        let mut cfg = config("a", 1);
        cfg.enabled = false;
        let router = router_with(vec![a], vec![cfg]);
        assert!(router.route(ProviderKind::CnEquity, false).await.is_empty());
    }

    #[tokio::test]
    async fn reload_changes_priorities() {
        let a = Arc::new(StubProvider {
            name: "a",
            fail: false,
            calls: AtomicU32::new(0),
        });
        let b = Arc::new(StubProvider {
            name: "b",
            fail: false,
            calls: AtomicU32::new(0),
        });
        let router = router_with(vec![a, b], vec![config("a", 1), config("b", 2)]);
        assert_eq!(router.route(ProviderKind::CnEquity, false).await, vec!["a", "b"]);

        router.reload(vec![config("a", 5), config("b", 1)]).await;
        assert_eq!(router.route(ProviderKind::CnEquity, false).await, vec!["b", "a"]);
    }
}
