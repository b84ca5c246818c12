//! The usage ledger: one append-only record per completed billed call, plus
//! the monthly aggregate derived from it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::UsageQueries;
use crate::error::Error;

/// One billed operation. Written once per completed call; never mutated.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub service: String,
    pub model: String,
    pub operation: String,
    pub user_id: String,
    pub tokens: u64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(
        service: &str,
        model: &str,
        operation: &str,
        user_id: &str,
        tokens: u64,
        cost: f64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            service: service.to_string(),
            model: model.to_string(),
            operation: operation.to_string(),
            user_id: user_id.to_string(),
            tokens,
            cost,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate over a (service, user) pair for the current calendar month.
/// Recomputed from `UsageRecord`s on read, never stored.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyUsage {
    pub service: String,
    pub user_id: String,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub call_count: u64,
    pub by_model: HashMap<String, f64>,
}

impl MonthlyUsage {
    pub fn empty(service: &str, user_id: &str) -> Self {
        Self {
            service: service.to_string(),
            user_id: user_id.to_string(),
            total_cost: 0.0,
            total_tokens: 0,
            call_count: 0,
            by_model: HashMap::new(),
        }
    }

    pub fn add(&mut self, record: &UsageRecord) {
        self.total_cost += record.cost;
        self.total_tokens += record.tokens;
        self.call_count += 1;
        *self.by_model.entry(record.model.clone()).or_insert(0.0) += record.cost;
    }
}

/// Midnight UTC on the first day of `now`'s month.
pub fn first_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

pub fn days_in_month(now: DateTime<Utc>) -> u32 {
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let this_month_start = first_of_month(now);
    let next_month_start = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    (next_month_start - this_month_start).num_days().max(1) as u32
}

/// Facade over the ledger backend. Writes are absorbed: a failed insert is
/// logged and the caller's request proceeds.
#[derive(Clone)]
pub struct UsageLedger {
    queries: Arc<dyn UsageQueries>,
}

impl UsageLedger {
    pub fn new(queries: Arc<dyn UsageQueries>) -> Self {
        Self { queries }
    }

    /// Append one billed operation. Never fails the caller: ledger
    /// unavailability is an infrastructure problem, not the user's.
    pub async fn record(&self, record: UsageRecord) {
        if let Err(e) = self.queries.insert_usage(&record).await {
            tracing::warn!(
                "Failed to record usage for user `{}` service `{}`: {e}",
                record.user_id,
                record.service
            );
        }
    }

    pub async fn monthly_usage(
        &self,
        service: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MonthlyUsage, Error> {
        self.queries.monthly_usage(service, user_id, now).await
    }

    pub async fn active_pairs(&self, now: DateTime<Utc>) -> Result<Vec<(String, String)>, Error> {
        self.queries.active_pairs(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MockUsageQueries;
    use crate::error::ErrorDetails;

    #[test]
    fn test_first_of_month() {
        let now = Utc.with_ymd_and_hms(2026, 8, 14, 9, 30, 0).single().unwrap();
        let start = first_of_month(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).single().unwrap());
    }

    #[test]
    fn test_days_in_month_handles_february_and_december() {
        let feb = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).single().unwrap();
        assert_eq!(days_in_month(feb), 28);
        let leap_feb = Utc.with_ymd_and_hms(2028, 2, 10, 0, 0, 0).single().unwrap();
        assert_eq!(days_in_month(leap_feb), 29);
        let dec = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 0).single().unwrap();
        assert_eq!(days_in_month(dec), 31);
    }

    #[test]
    fn test_monthly_usage_accumulates_by_model() {
        let mut usage = MonthlyUsage::empty("text_generation", "user-1");
        usage.add(&UsageRecord::new(
            "text_generation",
            "gpt-4o",
            "generate-copy",
            "user-1",
            1000,
            2.0,
        ));
        usage.add(&UsageRecord::new(
            "text_generation",
            "gpt-4o-mini",
            "generate-copy",
            "user-1",
            500,
            0.25,
        ));
        usage.add(&UsageRecord::new(
            "text_generation",
            "gpt-4o",
            "generate-headline",
            "user-1",
            200,
            0.5,
        ));

        assert_eq!(usage.call_count, 3);
        assert_eq!(usage.total_tokens, 1700);
        assert!((usage.total_cost - 2.75).abs() < f64::EPSILON);
        assert!((usage.by_model["gpt-4o"] - 2.5).abs() < f64::EPSILON);
        assert!((usage.by_model["gpt-4o-mini"] - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_record_absorbs_backend_failures() {
        let mut queries = MockUsageQueries::new();
        queries.expect_insert_usage().returning(|_| {
            Box::pin(async {
                Err(Error::new(ErrorDetails::PostgresQuery {
                    message: "connection reset".to_string(),
                }))
            })
        });

        let ledger = UsageLedger::new(Arc::new(queries));
        // Must not panic or propagate; the caller's request goes on.
        ledger
            .record(UsageRecord::new(
                "text_generation",
                "gpt-4o",
                "generate-copy",
                "user-1",
                100,
                0.1,
            ))
            .await;
    }
}
