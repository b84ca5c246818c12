//! Postgres usage-ledger backend.
//!
//! Expects a `usage_records` table with columns `(id UUID PRIMARY KEY,
//! service TEXT, model TEXT, operation TEXT, user_id TEXT, tokens BIGINT,
//! cost DOUBLE PRECISION, created_at TIMESTAMPTZ)`. Schema management lives
//! with the surrounding application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::db::{HealthCheckable, UsageQueries};
use crate::error::{Error, ErrorDetails};
use crate::usage::{first_of_month, MonthlyUsage, UsageRecord};

#[derive(Clone, Debug)]
pub enum PostgresConnectionInfo {
    Enabled { pool: PgPool },
    Disabled,
}

impl PostgresConnectionInfo {
    pub async fn new(postgres_url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .connect(postgres_url)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresConnection {
                    message: format!("Failed to connect to Postgres: {e}"),
                })
            })?;
        Ok(Self::Enabled { pool })
    }

    pub fn new_with_pool(pool: PgPool) -> Self {
        Self::Enabled { pool }
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    fn get_pool(&self) -> Result<&PgPool, Error> {
        match self {
            Self::Enabled { pool } => Ok(pool),
            Self::Disabled => Err(Error::new(ErrorDetails::PostgresConnection {
                message: "Postgres backend is disabled".to_string(),
            })),
        }
    }
}

#[async_trait]
impl UsageQueries for PostgresConnectionInfo {
    async fn insert_usage(&self, record: &UsageRecord) -> Result<(), Error> {
        let pool = self.get_pool()?;
        sqlx::query(
            r"
            INSERT INTO usage_records
                (id, service, model, operation, user_id, tokens, cost, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(record.id)
        .bind(&record.service)
        .bind(&record.model)
        .bind(&record.operation)
        .bind(&record.user_id)
        .bind(record.tokens as i64)
        .bind(record.cost)
        .bind(record.timestamp)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn monthly_usage(
        &self,
        service: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<MonthlyUsage, Error> {
        let pool = self.get_pool()?;
        let rows = sqlx::query(
            r"
            SELECT
                model,
                SUM(cost) AS model_cost,
                SUM(tokens)::BIGINT AS model_tokens,
                COUNT(*) AS model_calls
            FROM usage_records
            WHERE service = $1
                AND user_id = $2
                AND created_at >= $3
                AND created_at <= $4
            GROUP BY model
            ",
        )
        .bind(service)
        .bind(user_id)
        .bind(first_of_month(now))
        .bind(now)
        .fetch_all(pool)
        .await?;

        let mut usage = MonthlyUsage::empty(service, user_id);
        for row in rows {
            let model: String = row.get("model");
            let model_cost: f64 = row.get("model_cost");
            let model_tokens: i64 = row.get("model_tokens");
            let model_calls: i64 = row.get("model_calls");
            usage.total_cost += model_cost;
            usage.total_tokens += model_tokens.max(0) as u64;
            usage.call_count += model_calls.max(0) as u64;
            usage.by_model.insert(model, model_cost);
        }
        Ok(usage)
    }

    async fn active_pairs(&self, now: DateTime<Utc>) -> Result<Vec<(String, String)>, Error> {
        let pool = self.get_pool()?;
        let rows = sqlx::query(
            r"
            SELECT DISTINCT user_id, service
            FROM usage_records
            WHERE created_at >= $1 AND created_at <= $2
            ORDER BY user_id, service
            ",
        )
        .bind(first_of_month(now))
        .bind(now)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("user_id"), row.get("service")))
            .collect())
    }
}

#[async_trait]
impl HealthCheckable for PostgresConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        match self {
            Self::Disabled => Ok(()),
            Self::Enabled { pool } => {
                sqlx::query("SELECT 1").execute(pool).await.map_err(|e| {
                    Error::new(ErrorDetails::PostgresConnection {
                        message: format!("Postgres health check failed: {e}"),
                    })
                })?;
                Ok(())
            }
        }
    }
}
