//! Two-tier cache: in-process LRU (L1) plus an optional shared Redis tier
//! (L2). Keys are `prefix:` + a short SHA-256 digest of the canonicalized
//! parameters, so logically-equal lookups hash identically regardless of
//! parameter order. An L2 hit is promoted to L1 with the same TTL.

use lru::LruCache;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use market_core::config::{CachePolicy, CacheTier};

const L1_CAPACITY: usize = 100;

struct L1Entry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
}

impl L1Entry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1_size: usize,
    pub l2_enabled: bool,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

pub struct CacheLayer {
    policies: HashMap<String, CachePolicy>,
    // One bounded LRU per prefix, all behind one short-held mutex.
    l1: Mutex<HashMap<String, LruCache<String, L1Entry>>>,
    l2: Option<ConnectionManager>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheLayer {
    pub fn new(policies: HashMap<String, CachePolicy>) -> Self {
        Self {
            policies,
            l1: Mutex::new(HashMap::new()),
            l2: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Attach the shared Redis tier. Callers that run without Redis simply
    /// never call this; every L2 policy then behaves as L1-only.
    pub fn with_l2(mut self, connection: ConnectionManager) -> Self {
        self.l2 = Some(connection);
        self
    }

    fn policy_for(&self, prefix: &str) -> CachePolicy {
        self.policies.get(prefix).cloned().unwrap_or(CachePolicy {
            tier: CacheTier::L1,
            ttl_secs: 3600,
        })
    }

    /// `prefix:` + first 8 hex chars of SHA-256 over sorted-key JSON.
    pub fn cache_key(prefix: &str, params: &Value) -> String {
        let canonical = canonicalize(params);
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{prefix}:{}", &hex::encode(digest)[..8])
    }

    pub async fn get(&self, prefix: &str, params: &Value) -> Option<Value> {
        let policy = self.policy_for(prefix);
        let key = Self::cache_key(prefix, params);

        if let Some(value) = self.l1_get(prefix, &key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }

        if policy.tier == CacheTier::L2 {
            if let Some(value) = self.l2_get(&key).await {
                // Promote with the same TTL.
                self.l1_put(prefix, key, value.clone(), Duration::from_secs(policy.ttl_secs));
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn put(&self, prefix: &str, params: &Value, value: Value) {
        let policy = self.policy_for(prefix);
        let key = Self::cache_key(prefix, params);
        self.l1_put(prefix, key.clone(), value.clone(), Duration::from_secs(policy.ttl_secs));

        if policy.tier == CacheTier::L2 {
            if let Some(l2) = &self.l2 {
                let mut conn = l2.clone();
                let payload = value.to_string();
                if let Err(e) = conn
                    .set_ex::<_, _, ()>(&key, payload, policy.ttl_secs)
                    .await
                {
                    tracing::warn!(key = key.as_str(), error = %e, "[WARN] L2 cache set failed");
                }
            }
        }
    }

    /// Drop one exact entry, or every entry under the prefix.
    pub async fn invalidate(&self, prefix: &str, params: Option<&Value>) {
        let mut l1 = match self.l1.lock() {
            Ok(l1) => l1,
            Err(poisoned) => poisoned.into_inner(),
        };
        match params {
            Some(params) => {
                let key = Self::cache_key(prefix, params);
                if let Some(cache) = l1.get_mut(prefix) {
                    cache.pop(&key);
                }
                drop(l1);
                if let Some(l2) = &self.l2 {
                    let mut conn = l2.clone();
                    let _: Result<(), _> = conn.del(&key).await;
                }
            }
            None => {
                l1.remove(prefix);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let l1_size = match self.l1.lock() {
            Ok(l1) => l1.values().map(|c| c.len()).sum(),
            Err(poisoned) => poisoned.into_inner().values().map(|c| c.len()).sum(),
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            l1_size,
            l2_enabled: self.l2.is_some(),
        }
    }

    fn l1_get(&self, prefix: &str, key: &str) -> Option<Value> {
        let mut l1 = match self.l1.lock() {
            Ok(l1) => l1,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cache = l1.get_mut(prefix)?;
        match cache.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                // Past TTL counts as a miss.
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn l1_put(&self, prefix: &str, key: String, value: Value, ttl: Duration) {
        let mut l1 = match self.l1.lock() {
            Ok(l1) => l1,
            Err(poisoned) => poisoned.into_inner(),
        };
        let capacity = NonZeroUsize::new(L1_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        let cache = l1
            .entry(prefix.to_string())
            .or_insert_with(|| LruCache::new(capacity));
        cache.put(
            key,
            L1Entry {
                value,
                created_at: Instant::now(),
                ttl,
            },
        );
    }

    async fn l2_get(&self, key: &str) -> Option<Value> {
        let l2 = self.l2.as_ref()?;
        let mut conn = l2.clone();
        match conn.get::<_, Option<String>>(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "[WARN] L2 cache get failed");
                None
            }
        }
    }
}

/// JSON with object keys sorted recursively, so `{a,b}` and `{b,a}` hash
/// to the same cache key.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", k, canonicalize(&map[k.as_str()])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> CacheLayer {
        let mut policies = HashMap::new();
        policies.insert(
            "stock_quotes".to_string(),
            CachePolicy {
                tier: CacheTier::L1,
                ttl_secs: 60,
            },
        );
        policies.insert(
            "stock_info".to_string(),
            CachePolicy {
                tier: CacheTier::L1,
                ttl_secs: 3600,
            },
        );
        CacheLayer::new(policies)
    }

    #[tokio::test]
    async fn hit_and_miss_counters_add_up() {
        let cache = cache();
        let params = json!({"code": "600000"});
        assert!(cache.get("stock_quotes", &params).await.is_none());
        cache
            .put("stock_quotes", &params, json!({"price": 10.0}))
            .await;
        assert!(cache.get("stock_quotes", &params).await.is_some());
        assert!(cache.get("stock_quotes", &json!({"code": "000001"})).await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn key_is_order_insensitive() {
        let a = CacheLayer::cache_key("stock_info", &json!({"a": 1, "b": 2}));
        let b = CacheLayer::cache_key("stock_info", &json!({"b": 2, "a": 1}));
        assert_eq!(a, b);
        let c = CacheLayer::cache_key("stock_info", &json!({"a": 1, "b": 3}));
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let mut policies = HashMap::new();
        policies.insert(
            "stock_quotes".to_string(),
            CachePolicy {
                tier: CacheTier::L1,
                ttl_secs: 0,
            },
        );
        let cache = CacheLayer::new(policies);
        let params = json!({"code": "600000"});
        cache.put("stock_quotes", &params, json!(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.get("stock_quotes", &params).await.is_none());
    }

    #[tokio::test]
    async fn exact_and_prefix_invalidation() {
        let cache = cache();
        let a = json!({"code": "600000"});
        let b = json!({"code": "000001"});
        cache.put("stock_info", &a, json!(1)).await;
        cache.put("stock_info", &b, json!(2)).await;

        cache.invalidate("stock_info", Some(&a)).await;
        assert!(cache.get("stock_info", &a).await.is_none());
        assert!(cache.get("stock_info", &b).await.is_some());

        cache.invalidate("stock_info", None).await;
        assert!(cache.get("stock_info", &b).await.is_none());
    }

    #[tokio::test]
    async fn lru_evicts_past_capacity() {
        let cache = cache();
        for i in 0..(L1_CAPACITY + 10) {
            cache
                .put("stock_info", &json!({"code": i}), json!(i))
                .await;
        }
        let stats = cache.stats();
        assert_eq!(stats.l1_size, L1_CAPACITY);
        // The oldest entries fell out.
        assert!(cache.get("stock_info", &json!({"code": 0})).await.is_none());
        assert!(cache
            .get("stock_info", &json!({"code": L1_CAPACITY + 9}))
            .await
            .is_some());
    }
}
