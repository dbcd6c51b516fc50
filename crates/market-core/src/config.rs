use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

use crate::types::ProviderKind;

/// One upstream data source, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub enabled: bool,
    /// Lower = tried first.
    pub priority: i32,
    /// Name of the environment variable holding the credential; the value
    /// itself never enters config or logs.
    pub credentials_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobConfig {
    pub name: String,
    pub data_class: String,
    /// Seconds between scheduler triggers.
    pub interval_secs: u64,
    pub chunk_size: usize,
    pub timeout_secs: u64,
    /// Whether the trigger is gated on market hours.
    pub market_hours_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub default_max_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    L1,
    L2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    pub tier: CacheTier,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub daily_quota: i64,
    pub concurrent_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    pub tick_secs: u64,
    pub failure_threshold: u32,
    pub response_time_threshold_secs: u64,
}

/// Typed application configuration. Loaded once at startup from the
/// environment; passed into constructors explicitly (no globals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub providers: Vec<ProviderConfig>,
    pub sync_jobs: Vec<SyncJobConfig>,
    pub worker_pool: WorkerPoolConfig,
    pub cache_policies: HashMap<String, CachePolicy>,
    pub quotas: QuotaConfig,
    pub health_monitor: HealthMonitorConfig,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub bind_addr: String,
    pub akshare_base_url: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl AppConfig {
    /// Build config from environment variables with per-field defaults.
    /// `validate` decides whether the result is usable.
    pub fn from_env() -> Self {
        let providers = vec![
            ProviderConfig {
                name: "tushare".to_string(),
                kind: ProviderKind::CnEquity,
                enabled: env_flag("TUSHARE_ENABLED", true),
                priority: env_parse("TUSHARE_PRIORITY", 1),
                credentials_ref: Some("TUSHARE_TOKEN".to_string()),
            },
            ProviderConfig {
                name: "akshare".to_string(),
                kind: ProviderKind::CnEquity,
                enabled: env_flag("AKSHARE_ENABLED", true),
                priority: env_parse("AKSHARE_PRIORITY", 2),
                credentials_ref: None,
            },
            ProviderConfig {
                name: "yfinance".to_string(),
                kind: ProviderKind::UsEquity,
                enabled: env_flag("YFINANCE_ENABLED", true),
                priority: env_parse("YFINANCE_PRIORITY", 3),
                credentials_ref: None,
            },
        ];

        let sync_jobs = vec![
            SyncJobConfig {
                name: "stock_basics".to_string(),
                data_class: "basic_info".to_string(),
                interval_secs: env_parse("BASICS_SYNC_INTERVAL", 24 * 3600),
                chunk_size: env_parse("BASICS_SYNC_CHUNK", 500),
                timeout_secs: 60,
                market_hours_only: false,
            },
            SyncJobConfig {
                name: "historical_bars".to_string(),
                data_class: "historical".to_string(),
                interval_secs: env_parse("HISTORICAL_SYNC_INTERVAL", 24 * 3600),
                chunk_size: env_parse("HISTORICAL_SYNC_CHUNK", 50),
                timeout_secs: 120,
                market_hours_only: false,
            },
            SyncJobConfig {
                name: "financials".to_string(),
                data_class: "financial".to_string(),
                interval_secs: env_parse("FINANCIAL_SYNC_INTERVAL", 7 * 24 * 3600),
                chunk_size: env_parse("FINANCIAL_SYNC_CHUNK", 50),
                timeout_secs: 120,
                market_hours_only: false,
            },
            SyncJobConfig {
                name: "market_quotes".to_string(),
                data_class: "quotes".to_string(),
                interval_secs: env_parse("QUOTE_SYNC_INTERVAL", 360),
                chunk_size: env_parse("QUOTE_SYNC_CHUNK", 500),
                timeout_secs: 60,
                market_hours_only: true,
            },
        ];

        let mut cache_policies = HashMap::new();
        cache_policies.insert(
            "stock_info".to_string(),
            CachePolicy {
                tier: CacheTier::L1,
                ttl_secs: 3600,
            },
        );
        cache_policies.insert(
            "stock_quotes".to_string(),
            CachePolicy {
                tier: CacheTier::L1,
                ttl_secs: 60,
            },
        );
        cache_policies.insert(
            "analysis_result".to_string(),
            CachePolicy {
                tier: CacheTier::L2,
                ttl_secs: 7200,
            },
        );
        cache_policies.insert(
            "market_data".to_string(),
            CachePolicy {
                tier: CacheTier::L1,
                ttl_secs: 300,
            },
        );

        Self {
            providers,
            sync_jobs,
            worker_pool: WorkerPoolConfig {
                workers: env_parse("ANALYSIS_WORKERS", 4),
                default_max_retries: env_parse("ANALYSIS_MAX_RETRIES", 3),
            },
            cache_policies,
            quotas: QuotaConfig {
                daily_quota: env_parse("USER_DAILY_QUOTA", 1000),
                concurrent_limit: env_parse("USER_CONCURRENT_LIMIT", 3),
            },
            health_monitor: HealthMonitorConfig {
                tick_secs: env_parse("HEALTH_TICK_SECONDS", 300),
                failure_threshold: env_parse("HEALTH_FAILURE_THRESHOLD", 3),
                response_time_threshold_secs: env_parse("HEALTH_RESPONSE_THRESHOLD", 30),
            },
            database_url: env_or("DATABASE_URL", "sqlite:marketflow.db"),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            akshare_base_url: env_or("AKSHARE_BASE_URL", "http://127.0.0.1:8888"),
        }
    }

    /// Startup validation. Returns the human-readable list of offenders;
    /// a non-empty list is fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut offenders = Vec::new();

        if self.providers.iter().filter(|p| p.enabled).count() == 0 {
            offenders.push("providers: no provider is enabled".to_string());
        }
        for provider in &self.providers {
            if !provider.enabled {
                continue;
            }
            if let Some(cred_ref) = &provider.credentials_ref {
                let missing = env::var(cred_ref).map(|v| v.is_empty()).unwrap_or(true);
                if missing {
                    offenders.push(format!(
                        "providers.{}: credential env var {} is not set",
                        provider.name, cred_ref
                    ));
                }
            }
        }

        if self.worker_pool.workers == 0 {
            offenders.push("worker_pool.workers: must be at least 1".to_string());
        }
        for job in &self.sync_jobs {
            if job.chunk_size == 0 {
                offenders.push(format!("sync_jobs.{}: chunk_size must be > 0", job.name));
            }
            if job.interval_secs == 0 {
                offenders.push(format!("sync_jobs.{}: interval_secs must be > 0", job.name));
            }
        }
        if self.quotas.daily_quota <= 0 {
            offenders.push("quotas.daily_quota: must be > 0".to_string());
        }
        if self.quotas.concurrent_limit <= 0 {
            offenders.push("quotas.concurrent_limit: must be > 0".to_string());
        }
        if self.health_monitor.tick_secs < 10 {
            offenders.push("health_monitor.tick_secs: minimum is 10".to_string());
        }
        if self.database_url.is_empty() {
            offenders.push("database_url: must not be empty".to_string());
        }

        offenders
    }

    /// Redacted summary for the admin endpoint. Credential refs are shown
    /// as variable names only; values never leave the environment.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "providers": self.providers.iter().map(|p| serde_json::json!({
                "name": p.name,
                "kind": p.kind.as_str(),
                "enabled": p.enabled,
                "priority": p.priority,
                "credentials_ref": p.credentials_ref,
            })).collect::<Vec<_>>(),
            "sync_jobs": self.sync_jobs,
            "worker_pool": self.worker_pool,
            "quotas": self.quotas,
            "health_monitor": self.health_monitor,
            "cache_policies": self.cache_policies,
            "bind_addr": self.bind_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        let mut cfg = AppConfig::from_env();
        // Tests must not depend on ambient env; force a deterministic shape.
        for p in &mut cfg.providers {
            p.credentials_ref = None;
        }
        cfg
    }

    #[test]
    fn default_config_validates() {
        let cfg = base_config();
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
    }

    #[test]
    fn zero_workers_is_an_offender() {
        let mut cfg = base_config();
        cfg.worker_pool.workers = 0;
        let offenders = cfg.validate();
        assert!(offenders.iter().any(|o| o.contains("worker_pool.workers")));
    }

    #[test]
    fn disabled_everything_is_an_offender() {
        let mut cfg = base_config();
        for p in &mut cfg.providers {
            p.enabled = false;
        }
        let offenders = cfg.validate();
        assert!(offenders.iter().any(|o| o.contains("no provider is enabled")));
    }

    #[test]
    fn summary_masks_credentials() {
        let mut cfg = base_config();
        cfg.providers[0].credentials_ref = Some("TUSHARE_TOKEN".to_string());
        let text = cfg.summary().to_string();
        assert!(text.contains("TUSHARE_TOKEN"));
        // Only the ref name appears, never a value read from the env.
        assert!(!text.contains("token_value"));
    }
}
