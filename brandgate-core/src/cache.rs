//! In-process response cache for deterministic AI generations.
//!
//! A hit short-circuits the pipeline downstream of admission: the request
//! still consumes its rate-limit hit, but no budget preflight runs, no
//! provider call is made, and nothing is written to the usage ledger.
//! Identical inputs must therefore produce identical keys regardless of
//! request-map ordering, which is what the canonical fingerprint below
//! guarantees.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use moka::Expiry;
use serde::Serialize;
use serde_json::Value;

use crate::config::CacheConfig;

/// Fingerprint of one (operation, parameters) pair.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Get the short hex representation of the key for logging.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Rebuilds `value` with every object's keys in sorted order, recursively.
/// Two parameter maps with the same entries then serialize identically.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by_key(|(key, _)| key.as_str());
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(key, inner)| (key.clone(), canonicalize(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Fingerprint the operation name and canonical parameter JSON.
///
/// The operation and parameter segments are length-prefixed so that no two
/// distinct (operation, parameters) pairs can collide by shifting bytes
/// between segments.
pub fn cache_key(operation: &str, parameters: &Value) -> CacheKey {
    let canonical = canonicalize(parameters).to_string();
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(operation.len() as u64).to_le_bytes());
    hasher.update(operation.as_bytes());
    hasher.update(&(canonical.len() as u64).to_le_bytes());
    hasher.update(canonical.as_bytes());
    CacheKey(*hasher.finalize().as_bytes())
}

/// One cached generation, with the TTL it was stored under.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CachedResponse {
    pub payload: Value,
    pub cached_at: DateTime<Utc>,
    #[serde(skip)]
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<CacheKey, CachedResponse> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded in-process cache with a per-entry TTL.
#[derive(Clone)]
pub struct ResponseCache {
    cache: Cache<CacheKey, CachedResponse>,
    default_ttl: Duration,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            default_ttl: config.ttl(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let hit = self.cache.get(key);
        if hit.is_some() {
            tracing::debug!("Response cache hit for key {}", key.short_hex());
        }
        hit
    }

    pub fn insert(&self, key: CacheKey, payload: Value) {
        self.insert_with_ttl(key, payload, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: CacheKey, payload: Value, ttl: Duration) {
        self.cache.insert(
            key,
            CachedResponse {
                payload,
                cached_at: Utc::now(),
                ttl,
            },
        );
    }

    /// Number of live entries; `run_pending_tasks` first so lazily expired
    /// entries don't inflate the count.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_is_insensitive_to_parameter_order() {
        let a = json!({"prompt": "summer sale banner", "model": "dall-e-3", "size": "1024x1024"});
        let b = json!({"size": "1024x1024", "model": "dall-e-3", "prompt": "summer sale banner"});
        assert_eq!(cache_key("generate-image", &a), cache_key("generate-image", &b));
    }

    #[test]
    fn test_key_sorts_nested_objects() {
        let a = json!({"options": {"tone": "playful", "language": "en"}});
        let b = json!({"options": {"language": "en", "tone": "playful"}});
        assert_eq!(cache_key("generate-copy", &a), cache_key("generate-copy", &b));
    }

    #[test]
    fn test_key_distinguishes_operations_and_parameters() {
        let params = json!({"prompt": "summer sale banner"});
        assert_ne!(
            cache_key("generate-image", &params),
            cache_key("generate-copy", &params)
        );
        assert_ne!(
            cache_key("generate-image", &params),
            cache_key("generate-image", &json!({"prompt": "winter sale banner"}))
        );
    }

    #[test]
    fn test_key_preserves_array_order() {
        let a = json!({"tags": ["summer", "sale"]});
        let b = json!({"tags": ["sale", "summer"]});
        assert_ne!(cache_key("generate-copy", &a), cache_key("generate-copy", &b));
    }

    #[test]
    fn test_insert_then_get_round_trips_payload() {
        let cache = ResponseCache::new(&CacheConfig::default());
        let key = cache_key("generate-copy", &json!({"prompt": "hello"}));

        assert!(cache.get(&key).is_none());
        cache.insert(key, json!({"text": "Hello there!"}));
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.payload, json!({"text": "Hello there!"}));
    }

    #[test]
    fn test_entries_expire_after_their_ttl() {
        let cache = ResponseCache::new(&CacheConfig::default());
        let key = cache_key("generate-copy", &json!({"prompt": "hello"}));

        cache.insert_with_ttl(key, json!({"text": "short-lived"}), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        // Expired entries are evicted lazily, so only the lookup result is
        // guaranteed here, not the internal entry count.
        assert!(cache.get(&key).is_none(), "entry should expire after its TTL");
    }
}
