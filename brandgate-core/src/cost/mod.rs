//! Budget enforcement and monitoring.
//!
//! The governor answers per-request "is this affordable" preflights against
//! realized monthly spend; the monitor sweeps active (user, service) pairs on
//! a timer and raises deduplicated alerts. Only the governor ever blocks a
//! request.

pub mod governor;
pub mod monitor;

pub use governor::{CostGovernor, Preflight, UsageStats};
pub use monitor::{
    AlertSeverity, AlertSink, AlertType, CostAlert, CostMonitor, DashboardData, LogAlertSink,
    ServiceMetrics, Trend,
};
