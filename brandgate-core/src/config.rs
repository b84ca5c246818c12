//! Governance configuration.
//!
//! All sections are TOML-deserializable and carry serde defaults so that a
//! partial config file (or none at all) yields a working setup. Budgets are
//! the only section with no meaningful default: an empty budget table means
//! every service is treated as unbudgeted (preflight always allows).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub budgets: BudgetConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file {}: {e}", path.display()),
            })
        })
    }
}

/// One admission window per operation category.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryLimit {
    /// Admitted requests per window.
    pub points: u32,
    pub window_s: u64,
}

impl CategoryLimit {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_s)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitingConfig {
    #[serde(default = "default_auth_limit")]
    pub auth: CategoryLimit,
    #[serde(default = "default_api_limit")]
    pub api: CategoryLimit,
    #[serde(default = "default_ai_limit")]
    pub ai: CategoryLimit,
    #[serde(default = "default_upload_limit")]
    pub upload: CategoryLimit,
    /// Policy when the counter store errors mid-check: `true` admits the
    /// request (fail open), `false` rejects it. Infrastructure failures
    /// should not block legitimate traffic, so the default is open.
    #[serde(default = "default_admit_on_store_error")]
    pub admit_on_store_error: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            auth: default_auth_limit(),
            api: default_api_limit(),
            ai: default_ai_limit(),
            upload: default_upload_limit(),
            admit_on_store_error: default_admit_on_store_error(),
        }
    }
}

fn default_auth_limit() -> CategoryLimit {
    CategoryLimit {
        points: 5,
        window_s: 60,
    }
}

fn default_api_limit() -> CategoryLimit {
    CategoryLimit {
        points: 100,
        window_s: 60,
    }
}

fn default_ai_limit() -> CategoryLimit {
    CategoryLimit {
        points: 20,
        window_s: 3600,
    }
}

fn default_upload_limit() -> CategoryLimit {
    CategoryLimit {
        points: 10,
        window_s: 300,
    }
}

fn default_admit_on_store_error() -> bool {
    true
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetConfig {
    /// Monthly budget per service, in dollars. Read-only at runtime.
    #[serde(default)]
    pub monthly_limits: HashMap<String, f64>,
    /// Cheaper model to fall back to once a service's budget is exhausted.
    /// Services without an entry are hard-rejected at 100%.
    #[serde(default)]
    pub fallback_models: HashMap<String, String>,
}

impl BudgetConfig {
    pub fn monthly_limit(&self, service: &str) -> Option<f64> {
        self.monthly_limits.get(service).copied()
    }

    pub fn fallback_model(&self, service: &str) -> Option<&str> {
        self.fallback_models.get(service).map(String::as_str)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: u64,
    #[serde(default = "default_call_timeout_s")]
    pub call_timeout_s: u64,
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_s)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_s)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_s: default_cooldown_s(),
            call_timeout_s: default_call_timeout_s(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_s() -> u64 {
    60
}

fn default_call_timeout_s() -> u64 {
    120
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Default time-to-live for cached generations. Hours rather than days:
    /// generation parameters drift too quickly for long retention.
    #[serde(default = "default_cache_ttl_s")]
    pub ttl_s: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_s)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_s: default_cache_ttl_s(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_ttl_s() -> u64 {
    6 * 60 * 60
}

fn default_cache_max_entries() -> u64 {
    10_000
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_sweep_interval_s")]
    pub sweep_interval_s: u64,
    /// A matching unacknowledged alert younger than this suppresses re-creation.
    #[serde(default = "default_alert_dedup_s")]
    pub alert_dedup_s: u64,
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_s)
    }

    pub fn alert_dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.alert_dedup_s as i64)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_s: default_sweep_interval_s(),
            alert_dedup_s: default_alert_dedup_s(),
        }
    }
}

fn default_sweep_interval_s() -> u64 {
    300
}

fn default_alert_dedup_s() -> u64 {
    3600
}
