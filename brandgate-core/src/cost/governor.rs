//! Pre-flight budget checks.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;

use crate::config::BudgetConfig;
use crate::error::Error;
use crate::usage::{days_in_month, MonthlyUsage, UsageLedger};

/// Spend-side warning threshold: between here and 100% the request is
/// admitted but the caller is told to warn the end user.
const WARN_PERCENT: f64 = 80.0;

/// Current-month budget position for one (service, user) pair.
///
/// The projection is a straight line through this month's average daily
/// spend. It is dashboard material only; admission decisions look at
/// realized spend alone.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub service: String,
    pub user_id: String,
    pub current_usage: f64,
    pub budget_limit: Option<f64>,
    pub percent_used: f64,
    pub remaining_budget: Option<f64>,
    pub average_daily_cost: f64,
    pub projected_monthly_usage: f64,
    pub total_tokens: u64,
    pub call_count: u64,
}

impl UsageStats {
    fn from_usage(usage: &MonthlyUsage, budget_limit: Option<f64>, now: DateTime<Utc>) -> Self {
        let percent_used = match budget_limit {
            Some(limit) if limit > 0.0 => usage.total_cost / limit * 100.0,
            _ => 0.0,
        };
        let average_daily_cost = usage.total_cost / f64::from(now.day());
        Self {
            service: usage.service.clone(),
            user_id: usage.user_id.clone(),
            current_usage: usage.total_cost,
            budget_limit,
            percent_used,
            remaining_budget: budget_limit.map(|limit| (limit - usage.total_cost).max(0.0)),
            average_daily_cost,
            projected_monthly_usage: average_daily_cost * f64::from(days_in_month(now)),
            total_tokens: usage.total_tokens,
            call_count: usage.call_count,
        }
    }

    fn unavailable(service: &str, user_id: &str, budget_limit: Option<f64>) -> Self {
        Self {
            service: service.to_string(),
            user_id: user_id.to_string(),
            current_usage: 0.0,
            budget_limit,
            percent_used: 0.0,
            remaining_budget: budget_limit,
            average_daily_cost: 0.0,
            projected_monthly_usage: 0.0,
            total_tokens: 0,
            call_count: 0,
        }
    }
}

/// Pre-flight verdict. `allowed == false` only when the budget is exhausted
/// and no fallback model is configured for the service.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preflight {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub usage_stats: UsageStats,
}

#[derive(Clone)]
pub struct CostGovernor {
    ledger: UsageLedger,
    budgets: BudgetConfig,
}

impl CostGovernor {
    pub fn new(ledger: UsageLedger, budgets: BudgetConfig) -> Self {
        Self { ledger, budgets }
    }

    /// Budget position for one (service, user) pair. Used by the monitor's
    /// sweep and the dashboard; errors propagate to the caller there.
    pub async fn status(
        &self,
        service: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UsageStats, Error> {
        let usage = self.ledger.monthly_usage(service, user_id, now).await?;
        Ok(UsageStats::from_usage(
            &usage,
            self.budgets.monthly_limit(service),
            now,
        ))
    }

    /// Decide whether one more billed call may proceed.
    ///
    /// Exhausted budget (>= 100% of the monthly limit) rejects the call
    /// unless a cheaper fallback model is configured for the service, in
    /// which case the call is admitted on that model. Between 80% and 100%
    /// the call is admitted with a warning attached. If the ledger cannot be
    /// read the check degrades to "allowed" with a warning; an unreachable
    /// store must not block legitimate traffic.
    pub async fn preflight(
        &self,
        service: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Preflight {
        let budget_limit = self.budgets.monthly_limit(service);
        let usage = match self.ledger.monthly_usage(service, user_id, now).await {
            Ok(usage) => usage,
            Err(e) => {
                tracing::warn!(
                    "Usage ledger unreadable during preflight for service `{service}` user \
                     `{user_id}`; allowing: {e}"
                );
                return Preflight {
                    allowed: true,
                    reason: None,
                    fallback_model: None,
                    warning: Some("usage data unavailable; budget not enforced".to_string()),
                    usage_stats: UsageStats::unavailable(service, user_id, budget_limit),
                };
            }
        };

        let usage_stats = UsageStats::from_usage(&usage, budget_limit, now);

        if usage_stats.percent_used >= 100.0 {
            return match self.budgets.fallback_model(service) {
                Some(fallback) => Preflight {
                    allowed: true,
                    reason: None,
                    fallback_model: Some(fallback.to_string()),
                    warning: Some(format!(
                        "monthly budget exhausted ({:.1}% used); downgraded to `{fallback}`",
                        usage_stats.percent_used
                    )),
                    usage_stats,
                },
                None => Preflight {
                    allowed: false,
                    reason: Some("budget exhausted".to_string()),
                    fallback_model: None,
                    warning: None,
                    usage_stats,
                },
            };
        }

        let warning = (usage_stats.percent_used >= WARN_PERCENT).then(|| {
            format!(
                "approaching monthly budget: {:.1}% used",
                usage_stats.percent_used
            )
        });

        Preflight {
            allowed: true,
            reason: None,
            fallback_model: None,
            warning,
            usage_stats,
        }
    }
}
