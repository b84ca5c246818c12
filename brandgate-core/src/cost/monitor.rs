//! Periodic budget sweep and alerting.
//!
//! The sweep is advisory: it classifies each active (user, service) pair by
//! percent-of-budget and raises alerts, but it never blocks a request. Alert
//! delivery goes through a sink whose failures are absorbed; the monitor's
//! own record of the alert is the source of truth.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::cost::governor::{CostGovernor, UsageStats};
use crate::error::Error;
use crate::usage::{first_of_month, UsageLedger};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Threshold,
    MonthlyLimit,
    Emergency,
    DailyLimit,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One raised budget alert. Mutated only by acknowledgment.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAlert {
    pub id: Uuid,
    pub user_id: String,
    pub service: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub percent_used: f64,
    pub current_usage: f64,
    pub budget_limit: f64,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Classify a budget position. Below 80% nothing is raised.
fn classify(percent_used: f64) -> Option<(AlertType, AlertSeverity)> {
    if percent_used >= 95.0 {
        Some((AlertType::Emergency, AlertSeverity::Critical))
    } else if percent_used >= 90.0 {
        Some((AlertType::MonthlyLimit, AlertSeverity::High))
    } else if percent_used >= 80.0 {
        Some((AlertType::Threshold, AlertSeverity::Medium))
    } else {
        None
    }
}

/// Where raised alerts go (log line, chat webhook, ...). Delivery is
/// fire-and-forget; the monitor does not retry or fail on sink errors.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: &CostAlert);
}

/// Default sink: a structured warning in the process log.
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn deliver(&self, alert: &CostAlert) {
        tracing::warn!(
            "Budget alert [{:?}/{:?}] for user `{}` service `{}`: {:.1}% of ${:.2} used",
            alert.alert_type,
            alert.severity,
            alert.user_id,
            alert.service,
            alert.percent_used,
            alert.budget_limit,
        );
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Stable,
    Elevated,
    OverBudget,
}

/// Per-service dashboard row.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub current_usage: f64,
    pub budget_limit: f64,
    pub percent_used: f64,
    pub remaining_budget: f64,
    pub projected_monthly_usage: f64,
    pub average_daily_cost: f64,
    pub trend: Trend,
}

impl ServiceMetrics {
    fn from_stats(stats: &UsageStats, budget_limit: f64) -> Self {
        let trend = if stats.projected_monthly_usage > budget_limit {
            Trend::OverBudget
        } else if stats.projected_monthly_usage > budget_limit * 0.8 {
            Trend::Elevated
        } else {
            Trend::Stable
        };
        Self {
            current_usage: stats.current_usage,
            budget_limit,
            percent_used: stats.percent_used,
            remaining_budget: stats.remaining_budget.unwrap_or(budget_limit),
            projected_monthly_usage: stats.projected_monthly_usage,
            average_daily_cost: stats.average_daily_cost,
            trend,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub metrics: HashMap<String, ServiceMetrics>,
    pub recent_alerts: Vec<CostAlert>,
    pub total_spent: f64,
    pub total_budget: f64,
    pub overall_percent_used: f64,
}

const RECENT_ALERT_LIMIT: usize = 10;

pub struct CostMonitor {
    governor: CostGovernor,
    ledger: UsageLedger,
    config: MonitorConfig,
    budgeted_services: Vec<String>,
    alerts: Mutex<Vec<CostAlert>>,
    sink: Arc<dyn AlertSink>,
    // Taken for the duration of one sweep; a tick that arrives while the
    // previous sweep is still running is skipped, not queued.
    sweep_gate: tokio::sync::Mutex<()>,
}

impl CostMonitor {
    pub fn new(
        governor: CostGovernor,
        ledger: UsageLedger,
        config: MonitorConfig,
        budgeted_services: Vec<String>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            governor,
            ledger,
            config,
            budgeted_services,
            alerts: Mutex::new(Vec::new()),
            sink,
            sweep_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_alerts(&self) -> std::sync::MutexGuard<'_, Vec<CostAlert>> {
        match self.alerts.lock() {
            Ok(alerts) => alerts,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// One pass over every (user, service) pair with ledger activity this
    /// month. Returns the number of alerts created, or `None` when a
    /// previous sweep is still running.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Option<usize> {
        let Ok(_guard) = self.sweep_gate.try_lock() else {
            tracing::debug!("Skipping budget sweep; previous sweep still running");
            return None;
        };

        self.prune_alerts(now);

        let pairs = match self.ledger.active_pairs(now).await {
            Ok(pairs) => pairs,
            Err(e) => {
                tracing::warn!("Budget sweep could not list active pairs: {e}");
                return Some(0);
            }
        };

        let mut created = 0;
        for (user_id, service) in pairs {
            let stats = match self.governor.status(&service, &user_id, now).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::warn!(
                        "Budget sweep skipping user `{user_id}` service `{service}`: {e}"
                    );
                    continue;
                }
            };
            let Some(budget_limit) = stats.budget_limit else {
                continue;
            };
            let Some((alert_type, severity)) = classify(stats.percent_used) else {
                continue;
            };
            if self.raise(
                &user_id,
                &service,
                alert_type,
                severity,
                &stats,
                budget_limit,
                now,
            ) {
                created += 1;
            }
        }
        Some(created)
    }

    /// Create and deliver one alert unless a matching unacknowledged alert
    /// inside the dedup window suppresses it. Returns whether an alert was
    /// created.
    #[expect(clippy::too_many_arguments)]
    fn raise(
        &self,
        user_id: &str,
        service: &str,
        alert_type: AlertType,
        severity: AlertSeverity,
        stats: &UsageStats,
        budget_limit: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let dedup_window = self.config.alert_dedup_window();
        let mut alerts = self.lock_alerts();

        let suppressed = alerts.iter().any(|alert| {
            alert.user_id == user_id
                && alert.service == service
                && alert.alert_type == alert_type
                && !alert.acknowledged
                && now - alert.timestamp < dedup_window
        });
        if suppressed {
            return false;
        }

        let alert = CostAlert {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            service: service.to_string(),
            alert_type,
            severity,
            percent_used: stats.percent_used,
            current_usage: stats.current_usage,
            budget_limit,
            timestamp: now,
            acknowledged: false,
        };
        self.sink.deliver(&alert);
        alerts.push(alert);
        true
    }

    /// Drop alerts that no longer matter: acknowledged ones past the dedup
    /// window, and anything from a prior budget month. Without this the list
    /// only ever grows.
    fn prune_alerts(&self, now: DateTime<Utc>) {
        let dedup_window = self.config.alert_dedup_window();
        let month_start = first_of_month(now);
        let mut alerts = self.lock_alerts();
        alerts.retain(|alert| {
            alert.timestamp >= month_start
                && !(alert.acknowledged && now - alert.timestamp >= dedup_window)
        });
    }

    /// Newest-first alerts for one user.
    pub fn user_alerts(&self, user_id: &str, limit: usize) -> Vec<CostAlert> {
        let alerts = self.lock_alerts();
        let mut matching: Vec<CostAlert> = alerts
            .iter()
            .filter(|alert| alert.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit);
        matching
    }

    /// Mark one alert acknowledged. Returns whether the id was known.
    pub fn acknowledge(&self, alert_id: Uuid) -> bool {
        let mut alerts = self.lock_alerts();
        match alerts.iter_mut().find(|alert| alert.id == alert_id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Acknowledge on behalf of one user. An id belonging to a different
    /// user is treated as unknown, so callers cannot un-suppress alerts
    /// that are not theirs.
    pub fn acknowledge_for(&self, user_id: &str, alert_id: Uuid) -> bool {
        let mut alerts = self.lock_alerts();
        match alerts
            .iter_mut()
            .find(|alert| alert.id == alert_id && alert.user_id == user_id)
        {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Per-service metrics, recent alerts, and totals for one user.
    pub async fn dashboard(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DashboardData, Error> {
        let mut metrics = HashMap::new();
        let mut total_spent = 0.0;
        let mut total_budget = 0.0;

        for service in &self.budgeted_services {
            let stats = self.governor.status(service, user_id, now).await?;
            let Some(budget_limit) = stats.budget_limit else {
                continue;
            };
            total_spent += stats.current_usage;
            total_budget += budget_limit;
            metrics.insert(
                service.clone(),
                ServiceMetrics::from_stats(&stats, budget_limit),
            );
        }

        let overall_percent_used = if total_budget > 0.0 {
            total_spent / total_budget * 100.0
        } else {
            0.0
        };

        Ok(DashboardData {
            metrics,
            recent_alerts: self.user_alerts(user_id, RECENT_ALERT_LIMIT),
            total_spent,
            total_budget,
            overall_percent_used,
        })
    }

    /// Run the sweep loop until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(created) = self.sweep(Utc::now()).await {
                    if created > 0 {
                        tracing::info!("Budget sweep raised {created} alert(s)");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::db::memory::InMemoryUsageLedger;
    use crate::usage::UsageRecord;
    use chrono::TimeZone;

    async fn seeded_monitor(spend: f64, limit: f64) -> (Arc<CostMonitor>, DateTime<Utc>) {
        let backend = Arc::new(InMemoryUsageLedger::new());
        let ledger = UsageLedger::new(backend);
        let now = Utc.with_ymd_and_hms(2026, 8, 20, 12, 0, 0).single().unwrap();
        let mut record = UsageRecord::new(
            "text_generation",
            "gpt-4o",
            "generate-copy",
            "user-1",
            1000,
            spend,
        );
        record.timestamp = now - chrono::Duration::hours(2);
        ledger.record(record).await;

        let budgets = BudgetConfig {
            monthly_limits: HashMap::from([("text_generation".to_string(), limit)]),
            fallback_models: HashMap::new(),
        };
        let governor = CostGovernor::new(ledger.clone(), budgets);
        let monitor = Arc::new(CostMonitor::new(
            governor,
            ledger,
            MonitorConfig::default(),
            vec!["text_generation".to_string()],
            Arc::new(LogAlertSink),
        ));
        (monitor, now)
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(classify(79.9), None);
        assert_eq!(
            classify(80.0),
            Some((AlertType::Threshold, AlertSeverity::Medium))
        );
        assert_eq!(
            classify(90.0),
            Some((AlertType::MonthlyLimit, AlertSeverity::High))
        );
        assert_eq!(
            classify(96.0),
            Some((AlertType::Emergency, AlertSeverity::Critical))
        );
    }

    #[tokio::test]
    async fn test_sweep_raises_emergency_alert_at_96_percent() {
        let (monitor, now) = seeded_monitor(96.0, 100.0).await;
        assert_eq!(monitor.sweep(now).await, Some(1));

        let alerts = monitor.user_alerts("user-1", 10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Emergency);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
        assert!(!alerts[0].acknowledged);
    }

    #[tokio::test]
    async fn test_sweep_below_threshold_raises_nothing() {
        let (monitor, now) = seeded_monitor(50.0, 100.0).await;
        assert_eq!(monitor.sweep(now).await, Some(0));
        assert!(monitor.user_alerts("user-1", 10).is_empty());
    }

    #[tokio::test]
    async fn test_repeated_sweeps_deduplicate_within_the_hour() {
        let (monitor, now) = seeded_monitor(85.0, 100.0).await;

        // Twelve 5-minute sweeps inside one hour: one alert total.
        for minutes in (0..60).step_by(5) {
            monitor.sweep(now + chrono::Duration::minutes(minutes)).await;
        }
        assert_eq!(monitor.user_alerts("user-1", 100).len(), 1);

        // Past the dedup window the alert is raised again.
        assert_eq!(
            monitor.sweep(now + chrono::Duration::minutes(61)).await,
            Some(1)
        );
        assert_eq!(monitor.user_alerts("user-1", 100).len(), 2);
    }

    #[tokio::test]
    async fn test_acknowledged_alert_no_longer_suppresses() {
        let (monitor, now) = seeded_monitor(85.0, 100.0).await;
        monitor.sweep(now).await;
        let alert_id = monitor.user_alerts("user-1", 1)[0].id;

        assert!(monitor.acknowledge(alert_id));
        assert_eq!(
            monitor.sweep(now + chrono::Duration::minutes(5)).await,
            Some(1),
            "acknowledging should clear the dedup suppression"
        );
    }

    #[tokio::test]
    async fn test_sweep_prunes_acknowledged_and_stale_alerts() {
        let (monitor, now) = seeded_monitor(85.0, 100.0).await;
        monitor.sweep(now).await;
        let first_id = monitor.user_alerts("user-1", 1)[0].id;
        assert!(monitor.acknowledge(first_id));

        // Two hours on, the acknowledged alert is past the dedup window and
        // gets dropped; the sweep raises a fresh one in its place.
        assert_eq!(monitor.sweep(now + chrono::Duration::hours(2)).await, Some(1));
        let alerts = monitor.user_alerts("user-1", 100);
        assert_eq!(alerts.len(), 1);
        assert_ne!(alerts[0].id, first_id);

        // A sweep in the next budget month drops the remaining alert too.
        let next_month = Utc.with_ymd_and_hms(2026, 9, 5, 12, 0, 0).single().unwrap();
        monitor.sweep(next_month).await;
        assert!(monitor.user_alerts("user-1", 100).is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_for_rejects_other_users_alerts() {
        let (monitor, now) = seeded_monitor(85.0, 100.0).await;
        monitor.sweep(now).await;
        let alert_id = monitor.user_alerts("user-1", 1)[0].id;

        assert!(!monitor.acknowledge_for("user-2", alert_id));
        assert!(
            !monitor.user_alerts("user-1", 1)[0].acknowledged,
            "a foreign acknowledgment must not touch the alert"
        );
        assert!(monitor.acknowledge_for("user-1", alert_id));
        assert!(monitor.user_alerts("user-1", 1)[0].acknowledged);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_id_returns_false() {
        let (monitor, _) = seeded_monitor(85.0, 100.0).await;
        assert!(!monitor.acknowledge(Uuid::now_v7()));
    }

    #[tokio::test]
    async fn test_dashboard_aggregates_totals_and_trend() {
        let (monitor, now) = seeded_monitor(96.0, 100.0).await;
        monitor.sweep(now).await;

        let dashboard = monitor.dashboard("user-1", now).await.unwrap();
        assert!((dashboard.total_spent - 96.0).abs() < 1e-9);
        assert!((dashboard.total_budget - 100.0).abs() < 1e-9);
        assert!((dashboard.overall_percent_used - 96.0).abs() < 1e-9);
        assert_eq!(dashboard.recent_alerts.len(), 1);

        let metrics = &dashboard.metrics["text_generation"];
        assert_eq!(metrics.trend, Trend::OverBudget);
        assert!((metrics.remaining_budget - 4.0).abs() < 1e-9);
    }
}
