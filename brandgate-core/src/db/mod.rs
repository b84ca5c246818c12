//! Storage backends for the governance layer.
//!
//! Two externally shared resources live behind traits here: the hit counter
//! used by the rate limiter (Valkey, with an in-process fallback) and the
//! usage ledger (Postgres, with an in-memory implementation for tests and
//! degraded startup). Everything else in the crate is process-local.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::usage::{MonthlyUsage, UsageRecord};

pub mod memory;
pub mod postgres;
pub mod valkey;

#[async_trait]
pub trait HealthCheckable {
    async fn health(&self) -> Result<(), Error>;
}

/// A single per-key admission counter key, e.g. `ratelimit:ai:user:42`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CounterKey(pub String);

impl CounterKey {
    pub fn new(key: String) -> Self {
        CounterKey(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of one atomic check-and-increment against a counter backend.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowUsage {
    /// Hits recorded in the current window, including this one.
    pub total_hits: u64,
    /// When the window frees up again (for a sliding window, when the oldest
    /// live hit ages out).
    pub reset_at: DateTime<Utc>,
}

/// Atomic per-key hit counting with window expiry.
///
/// `record_hit` must be atomic per key: two concurrent callers never observe
/// the same pre-increment count. The rate limiter relies on this to make
/// check-and-increment a single operation.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait CounterQueries: Send + Sync {
    async fn record_hit(&self, key: &CounterKey, window: Duration) -> Result<WindowUsage, Error>;
}

/// Append-only billed-operation records plus monthly aggregation.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait UsageQueries: Send + Sync {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), Error>;

    /// Recomputed from records in `[first_of_month, now]` on every read; the
    /// aggregate is never stored independently, so it cannot drift.
    async fn monthly_usage(
        &self,
        service: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MonthlyUsage, Error>;

    /// Distinct `(user_id, service)` pairs with at least one record in the
    /// current calendar month. Drives the cost monitor's sweep.
    async fn active_pairs(&self, now: DateTime<Utc>) -> Result<Vec<(String, String)>, Error>;
}

/// Picks the counter backend at startup: the shared Valkey store when it is
/// configured and reachable, the in-process fixed-window counter otherwise.
///
/// The fallback is per-instance. Under horizontal scale-out each instance
/// counts alone, which weakens the effective limit by the instance count;
/// multi-instance deployments must treat Valkey as mandatory.
pub async fn select_counter_store(valkey_url: Option<&str>) -> Arc<dyn CounterQueries> {
    match valkey_url {
        Some(url) => match valkey::ValkeyConnectionInfo::new(url).await {
            Ok(connection) => match connection.health().await {
                Ok(()) => Arc::new(connection),
                Err(e) => {
                    tracing::warn!(
                        "Valkey is unreachable ({e}); rate limiting will use the in-process \
                         fallback counter. Limits are per-instance until Valkey recovers."
                    );
                    Arc::new(memory::InMemoryCounterStore::new())
                }
            },
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to Valkey ({e}); rate limiting will use the in-process \
                     fallback counter. Limits are per-instance until Valkey recovers."
                );
                Arc::new(memory::InMemoryCounterStore::new())
            }
        },
        None => {
            tracing::warn!(
                "No Valkey URL configured; rate limiting will use the in-process fallback counter."
            );
            Arc::new(memory::InMemoryCounterStore::new())
        }
    }
}
