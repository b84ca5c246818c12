//! Sliding/fixed-window admission control over the counter store.
//!
//! Check-and-increment is a single atomic counter operation: the limiter
//! never reads a count it didn't also bump. It also never returns an error;
//! store failures follow the configured `admit_on_store_error` policy, and
//! policy rejections come back as a decision with a retry-after.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CategoryLimit, RateLimitingConfig};
use crate::db::{CounterKey, CounterQueries};

/// Number of user-agent characters mixed into anonymous keys. Address-based
/// keys are shared behind proxies/NAT; the prefix splits obvious distinct
/// clients without keying on the full (high-cardinality) UA string.
const USER_AGENT_PREFIX_LEN: usize = 20;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitCategory {
    Auth,
    Api,
    Ai,
    Upload,
}

impl RateLimitCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitCategory::Auth => "auth",
            RateLimitCategory::Api => "api",
            RateLimitCategory::Ai => "ai",
            RateLimitCategory::Upload => "upload",
        }
    }
}

impl std::fmt::Display for RateLimitCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who is asking. An authenticated user always keys on their id; anonymous
/// traffic keys on address plus a user-agent prefix.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestIdentity {
    User { id: String },
    Anonymous { ip: IpAddr, user_agent: String },
}

impl RequestIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        RequestIdentity::User { id: id.into() }
    }

    pub fn anonymous(ip: IpAddr, user_agent: impl Into<String>) -> Self {
        RequestIdentity::Anonymous {
            ip,
            user_agent: user_agent.into(),
        }
    }

    /// Stable identifier used both in counter keys and as the ledger user id.
    pub fn stable_id(&self) -> String {
        match self {
            RequestIdentity::User { id } => format!("user:{id}"),
            RequestIdentity::Anonymous { ip, user_agent } => {
                let ua_prefix: String = user_agent.chars().take(USER_AGENT_PREFIX_LEN).collect();
                format!("ip:{ip}:{ua_prefix}")
            }
        }
    }

    pub fn counter_key(&self, category: RateLimitCategory) -> CounterKey {
        CounterKey::new(format!("ratelimit:{category}:{}", self.stable_id()))
    }
}

/// The admission verdict for one request. `allowed == false` always carries a
/// positive `retry_after_s`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,
}

impl RateLimitDecision {
    fn admitted(limit: CategoryLimit, total_hits: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: limit.points,
            remaining: u64::from(limit.points).saturating_sub(total_hits) as u32,
            reset_at,
            retry_after_s: None,
        }
    }

    fn rejected(limit: CategoryLimit, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let retry_after_s = (reset_at - now).num_seconds().max(1) as u64;
        Self {
            allowed: false,
            limit: limit.points,
            remaining: 0,
            reset_at,
            retry_after_s: Some(retry_after_s),
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterQueries>,
    config: RateLimitingConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterQueries>, config: RateLimitingConfig) -> Self {
        Self { store, config }
    }

    fn category_limit(&self, category: RateLimitCategory) -> CategoryLimit {
        match category {
            RateLimitCategory::Auth => self.config.auth,
            RateLimitCategory::Api => self.config.api,
            RateLimitCategory::Ai => self.config.ai,
            RateLimitCategory::Upload => self.config.upload,
        }
    }

    /// Check and increment in one atomic store call.
    ///
    /// Counter-store failures do not propagate: with `admit_on_store_error`
    /// (the default) the request is admitted and the failure logged, since
    /// blocking all traffic on a counter outage is worse than briefly
    /// over-admitting. With the flag off, the request is rejected for the
    /// remainder of the window.
    pub async fn check(
        &self,
        category: RateLimitCategory,
        identity: &RequestIdentity,
    ) -> RateLimitDecision {
        let limit = self.category_limit(category);
        let key = identity.counter_key(category);
        let now = Utc::now();

        match self.store.record_hit(&key, limit.window()).await {
            Ok(usage) => {
                if usage.total_hits <= u64::from(limit.points) {
                    RateLimitDecision::admitted(limit, usage.total_hits, usage.reset_at)
                } else {
                    RateLimitDecision::rejected(limit, usage.reset_at, now)
                }
            }
            Err(e) => {
                if self.config.admit_on_store_error {
                    tracing::warn!(
                        "Counter store failed for key `{key}`; admitting request (fail-open): {e}"
                    );
                    RateLimitDecision::admitted(limit, 0, now + chrono::Duration::seconds(limit.window_s as i64))
                } else {
                    tracing::warn!(
                        "Counter store failed for key `{key}`; rejecting request (fail-closed): {e}"
                    );
                    RateLimitDecision::rejected(
                        limit,
                        now + chrono::Duration::seconds(limit.window_s as i64),
                        now,
                    )
                }
            }
        }
    }
}
