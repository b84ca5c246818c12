//! Valkey (Redis-compatible) counter backend.
//!
//! Implements the sliding-window hit counter behind [`CounterQueries`]: each
//! hit is a sorted-set member scored by its millisecond timestamp, and one
//! atomic pipeline removes expired members, adds the current hit, counts the
//! live window, and refreshes the key's expiry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::timeout;
use uuid::Uuid;

use crate::db::{CounterKey, CounterQueries, HealthCheckable, WindowUsage};
use crate::error::{Error, ErrorDetails};

/// Connection info for the Valkey counter backend.
///
/// Uses `ConnectionManager` which provides:
/// - Automatic reconnection on connection loss
/// - Connection multiplexing for efficient async operations
/// - No connection pool management needed
#[derive(Clone)]
pub enum ValkeyConnectionInfo {
    Enabled { connection: Box<ConnectionManager> },
    Disabled,
}

impl ValkeyConnectionInfo {
    pub async fn new(valkey_url: &str) -> Result<Self, Error> {
        let client = Client::open(valkey_url).map_err(|e| {
            Error::new(ErrorDetails::ValkeyConnection {
                message: format!("Failed to create Valkey client: {e}"),
            })
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            Error::new(ErrorDetails::ValkeyConnection {
                message: format!("Failed to connect to Valkey: {e}"),
            })
        })?;

        Ok(Self::Enabled {
            connection: Box::new(connection),
        })
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    fn get_connection(&self) -> Result<ConnectionManager, Error> {
        match self {
            Self::Enabled { connection } => Ok(connection.as_ref().clone()),
            Self::Disabled => Err(Error::new(ErrorDetails::ValkeyConnection {
                message: "Valkey backend is disabled".to_string(),
            })),
        }
    }
}

#[async_trait]
impl CounterQueries for ValkeyConnectionInfo {
    async fn record_hit(&self, key: &CounterKey, window: Duration) -> Result<WindowUsage, Error> {
        let mut conn = self.get_connection()?;

        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let window_start_ms = now_ms - window_ms;
        // Members must be unique per hit; a v7 UUID also keeps them
        // time-ordered for debugging.
        let member = Uuid::now_v7().to_string();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZREMRANGEBYSCORE")
            .arg(key.as_str())
            .arg(0)
            .arg(window_start_ms)
            .ignore();
        pipe.cmd("ZADD")
            .arg(key.as_str())
            .arg(now_ms)
            .arg(&member)
            .ignore();
        pipe.cmd("ZCARD").arg(key.as_str());
        pipe.cmd("ZRANGE")
            .arg(key.as_str())
            .arg(0)
            .arg(0)
            .arg("WITHSCORES");
        pipe.cmd("PEXPIRE").arg(key.as_str()).arg(window_ms).ignore();

        let (total_hits, oldest): (u64, Vec<(String, i64)>) =
            pipe.query_async(&mut conn).await.map_err(|e| {
                Error::new(ErrorDetails::ValkeyQuery {
                    message: format!("Failed to record hit for key `{key}`: {e}"),
                })
            })?;

        // The window frees up when the oldest live hit ages out.
        let reset_at_ms = oldest
            .first()
            .map(|(_, score)| score + window_ms)
            .unwrap_or(now_ms + window_ms);
        let reset_at: DateTime<Utc> = Utc
            .timestamp_millis_opt(reset_at_ms)
            .single()
            .unwrap_or_else(|| Utc::now() + chrono::Duration::milliseconds(window_ms));

        Ok(WindowUsage {
            total_hits,
            reset_at,
        })
    }
}

const HEALTH_CHECK_TIMEOUT_MS: u64 = 1000;

#[async_trait]
impl HealthCheckable for ValkeyConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        match self {
            Self::Disabled => Ok(()),
            Self::Enabled { connection } => {
                let check = async {
                    let mut conn = connection.as_ref().clone();
                    let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(
                        |e| {
                            Error::new(ErrorDetails::ValkeyConnection {
                                message: format!("Valkey health check failed: {e}"),
                            })
                        },
                    )?;
                    if pong == "PONG" {
                        Ok(())
                    } else {
                        Err(Error::new(ErrorDetails::ValkeyConnection {
                            message: format!("Unexpected PING response: {pong}"),
                        }))
                    }
                };

                match timeout(Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS), check).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::new(ErrorDetails::ValkeyConnection {
                        message: "Valkey health check timed out".to_string(),
                    })),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_backend_rejects_hits() {
        let backend = ValkeyConnectionInfo::new_disabled();
        let key = CounterKey::new("ratelimit:api:user:1".to_string());
        let result = backend.record_hit(&key, Duration::from_secs(60)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disabled_backend_is_healthy() {
        // Disabled is an explicit operator choice, not a failure state.
        let backend = ValkeyConnectionInfo::new_disabled();
        assert!(backend.health().await.is_ok());
    }
}
