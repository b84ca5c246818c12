//! In-process storage backends.
//!
//! `InMemoryCounterStore` is the fixed-window fallback selected when Valkey
//! is unreachable at startup. `InMemoryUsageLedger` backs tests and degraded
//! startup. Neither is coordinated across process instances.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{CounterKey, CounterQueries, HealthCheckable, UsageQueries, WindowUsage};
use crate::error::{Error, ErrorDetails};
use crate::usage::{first_of_month, MonthlyUsage, UsageRecord};

#[derive(Debug)]
struct FixedWindowEntry {
    count: u64,
    reset_at: DateTime<Utc>,
}

/// Fixed-window counter keyed by a map entry; the window resets once `now`
/// passes `reset_at`. Unlike the Valkey backend this is not a sliding window,
/// which slightly favors admission at window boundaries.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<CounterKey, FixedWindowEntry>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_hit_at(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage, Error> {
        let mut entries = self.entries.lock().map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("In-memory counter lock poisoned: {e}"),
            })
        })?;

        // Drop lapsed windows opportunistically so the map doesn't grow
        // unboundedly under churning anonymous keys.
        entries.retain(|_, entry| entry.reset_at > now);

        let window_chrono = chrono::Duration::from_std(window).map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Rate limit window out of range: {e}"),
            })
        })?;

        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| FixedWindowEntry {
                count: 0,
                reset_at: now + window_chrono,
            });
        entry.count += 1;
        Ok(WindowUsage {
            total_hits: entry.count,
            reset_at: entry.reset_at,
        })
    }
}

#[async_trait]
impl CounterQueries for InMemoryCounterStore {
    async fn record_hit(&self, key: &CounterKey, window: Duration) -> Result<WindowUsage, Error> {
        self.record_hit_at(key, window, Utc::now())
    }
}

#[async_trait]
impl HealthCheckable for InMemoryCounterStore {
    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Vector-backed usage ledger. Append-only; aggregates are recomputed from
/// the records on every read, same as the Postgres backend.
#[derive(Debug, Default)]
pub struct InMemoryUsageLedger {
    records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    fn lock_records(&self) -> Result<std::sync::MutexGuard<'_, Vec<UsageRecord>>, Error> {
        self.records.lock().map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("In-memory ledger lock poisoned: {e}"),
            })
        })
    }
}

#[async_trait]
impl UsageQueries for InMemoryUsageLedger {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), Error> {
        self.lock_records()?.push(record.clone());
        Ok(())
    }

    async fn monthly_usage(
        &self,
        service: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MonthlyUsage, Error> {
        let records = self.lock_records()?;
        let month_start = first_of_month(now);
        let mut usage = MonthlyUsage::empty(service, user_id);
        for record in records.iter().filter(|r| {
            r.service == service
                && r.user_id == user_id
                && r.timestamp >= month_start
                && r.timestamp <= now
        }) {
            usage.add(record);
        }
        Ok(usage)
    }

    async fn active_pairs(&self, now: DateTime<Utc>) -> Result<Vec<(String, String)>, Error> {
        let records = self.lock_records()?;
        let month_start = first_of_month(now);
        let mut pairs: Vec<(String, String)> = records
            .iter()
            .filter(|r| r.timestamp >= month_start && r.timestamp <= now)
            .map(|r| (r.user_id.clone(), r.service.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }
}

#[async_trait]
impl HealthCheckable for InMemoryUsageLedger {
    async fn health(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key(s: &str) -> CounterKey {
        CounterKey::new(s.to_string())
    }

    #[test]
    fn test_counter_increments_within_window() {
        let store = InMemoryCounterStore::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 14, 12, 0, 0).single().unwrap();
        let window = Duration::from_secs(60);

        let first = store.record_hit_at(&key("ratelimit:api:user:1"), window, now).unwrap();
        assert_eq!(first.total_hits, 1);
        let second = store.record_hit_at(&key("ratelimit:api:user:1"), window, now).unwrap();
        assert_eq!(second.total_hits, 2);
        assert_eq!(first.reset_at, second.reset_at);
    }

    #[test]
    fn test_counter_resets_after_window_lapses() {
        let store = InMemoryCounterStore::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 14, 12, 0, 0).single().unwrap();
        let window = Duration::from_secs(60);

        store.record_hit_at(&key("ratelimit:api:user:1"), window, now).unwrap();
        store.record_hit_at(&key("ratelimit:api:user:1"), window, now).unwrap();

        let later = now + chrono::Duration::seconds(61);
        let usage = store.record_hit_at(&key("ratelimit:api:user:1"), window, later).unwrap();
        assert_eq!(usage.total_hits, 1, "lapsed window should restart the count");
        assert!(usage.reset_at > later);
    }

    #[test]
    fn test_counter_keys_are_independent() {
        let store = InMemoryCounterStore::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 14, 12, 0, 0).single().unwrap();
        let window = Duration::from_secs(60);

        store.record_hit_at(&key("ratelimit:api:user:1"), window, now).unwrap();
        let other = store.record_hit_at(&key("ratelimit:api:user:2"), window, now).unwrap();
        assert_eq!(other.total_hits, 1);
    }

    #[tokio::test]
    async fn test_ledger_monthly_usage_only_counts_current_month() {
        let ledger = InMemoryUsageLedger::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 14, 12, 0, 0).single().unwrap();
        let last_month = Utc.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).single().unwrap();

        let mut current = UsageRecord::new("text_generation", "gpt-4o", "generate-copy", "user-1", 900, 1.25);
        current.timestamp = now - chrono::Duration::hours(1);
        let mut stale = UsageRecord::new("text_generation", "gpt-4o", "generate-copy", "user-1", 500, 9.0);
        stale.timestamp = last_month;

        ledger.insert_usage(&current).await.unwrap();
        ledger.insert_usage(&stale).await.unwrap();

        let usage = ledger.monthly_usage("text_generation", "user-1", now).await.unwrap();
        assert_eq!(usage.call_count, 1);
        assert!((usage.total_cost - 1.25).abs() < f64::EPSILON);
        assert_eq!(usage.total_tokens, 900);
        assert_eq!(usage.by_model.get("gpt-4o").copied(), Some(1.25));
    }

    #[tokio::test]
    async fn test_ledger_active_pairs_deduplicates() {
        let ledger = InMemoryUsageLedger::new();
        let now = Utc.with_ymd_and_hms(2026, 8, 14, 12, 0, 0).single().unwrap();

        for i in 0..3 {
            let mut record = UsageRecord::new(
                "image_generation",
                "dall-e-3",
                "generate-image",
                "user-1",
                0,
                0.04,
            );
            record.timestamp = now - chrono::Duration::hours(i + 1);
            ledger.insert_usage(&record).await.unwrap();
        }
        let mut record =
            UsageRecord::new("text_generation", "gpt-4o", "generate-copy", "user-2", 100, 0.01);
        record.timestamp = now - chrono::Duration::minutes(30);
        ledger.insert_usage(&record).await.unwrap();

        let pairs = ledger.active_pairs(now).await.unwrap();
        assert_eq!(
            pairs,
            vec![
                ("user-1".to_string(), "image_generation".to_string()),
                ("user-2".to_string(), "text_generation".to_string()),
            ]
        );
    }
}
