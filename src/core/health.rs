//! Health monitoring for external collaborators.
//!
//! Each subsystem (publishing, data fetch, forecast model) reports every
//! success and failure. A monitor tracks the current run of consecutive
//! failures and decides whether it is bad enough to alert an operator.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Failure-run tracker
pub trait HealthMonitor: Send + Sync {
    fn report_success(&self, time: i64);
    fn report_failure(&self, time: i64);
    fn reset(&self);
    fn check_alert(&self, time: i64) -> bool;
}

/// Alert threshold: a run at least `timeout_secs` old with at least
/// `count` failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Zero or negative means the run's age does not matter
    #[serde(default)]
    pub timeout_secs: i64,

    /// Values below 1 are treated as 1
    #[serde(default)]
    pub count: u32,
}

impl AlertRule {
    pub fn new(timeout_secs: i64, count: u32) -> Self {
        Self {
            timeout_secs,
            count,
        }
    }

    fn matches(&self, run_age_ms: i64, run_len: u32) -> bool {
        let old_enough = self.timeout_secs <= 0 || run_age_ms >= self.timeout_secs.saturating_mul(1000);
        old_enough && run_len >= self.count.max(1)
    }
}

#[derive(Debug, Default)]
struct FailureRun {
    len: u32,
    start: Option<i64>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Alerts when any rule matches the current failure run
#[derive(Debug)]
pub struct MultiRuleMonitor {
    rules: Vec<AlertRule>,
    run: Mutex<FailureRun>,
}

impl MultiRuleMonitor {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            run: Mutex::new(FailureRun::default()),
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }
}

impl HealthMonitor for MultiRuleMonitor {
    fn report_success(&self, _time: i64) {
        *guard(&self.run) = FailureRun::default();
    }

    fn report_failure(&self, time: i64) {
        let mut run = guard(&self.run);
        run.len = run.len.saturating_add(1);
        // Reports can arrive out of order; the run starts at its earliest failure
        run.start = Some(run.start.map_or(time, |start| start.min(time)));
    }

    fn reset(&self) {
        *guard(&self.run) = FailureRun::default();
    }

    fn check_alert(&self, time: i64) -> bool {
        let run = guard(&self.run);
        let Some(start) = run.start else {
            return false;
        };
        let age = time.saturating_sub(start);
        self.rules.iter().any(|rule| rule.matches(age, run.len))
    }
}

/// Alerts iff the most recent report was a failure
#[derive(Debug, Default)]
pub struct LastOpMonitor {
    last_failed: Mutex<bool>,
}

impl LastOpMonitor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HealthMonitor for LastOpMonitor {
    fn report_success(&self, _time: i64) {
        *guard(&self.last_failed) = false;
    }

    fn report_failure(&self, _time: i64) {
        *guard(&self.last_failed) = true;
    }

    fn reset(&self) {
        *guard(&self.last_failed) = false;
    }

    fn check_alert(&self, _time: i64) -> bool {
        *guard(&self.last_failed)
    }
}

/// Monitored external collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Publish,
    DataFetch,
    Forecast,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Subsystem::Publish => "publish",
            Subsystem::DataFetch => "data_fetch",
            Subsystem::Forecast => "forecast",
        };
        f.write_str(s)
    }
}

/// Monitor policy selected in config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MonitorSettings {
    MultiRule {
        rules: Vec<AlertRule>,
    },
    #[default]
    LastOp,
}

impl MonitorSettings {
    pub fn build(&self) -> Box<dyn HealthMonitor> {
        match self {
            MonitorSettings::MultiRule { rules } => Box::new(MultiRuleMonitor::new(rules.clone())),
            MonitorSettings::LastOp => Box::new(LastOpMonitor::new()),
        }
    }
}

/// Monitor settings per subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_publish_monitor")]
    pub publish: MonitorSettings,

    #[serde(default = "default_fetch_monitor")]
    pub data_fetch: MonitorSettings,

    #[serde(default)]
    pub forecast: MonitorSettings,
}

fn default_publish_monitor() -> MonitorSettings {
    MonitorSettings::MultiRule {
        rules: vec![AlertRule::new(0, 3), AlertRule::new(3_600, 1)],
    }
}

fn default_fetch_monitor() -> MonitorSettings {
    MonitorSettings::MultiRule {
        rules: vec![AlertRule::new(1_800, 2)],
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            publish: default_publish_monitor(),
            data_fetch: default_fetch_monitor(),
            forecast: MonitorSettings::default(),
        }
    }
}

/// One monitor per subsystem, logging alert transitions
pub struct ServerHealth {
    publish: Box<dyn HealthMonitor>,
    data_fetch: Box<dyn HealthMonitor>,
    forecast: Box<dyn HealthMonitor>,
    alerting: Mutex<HashSet<Subsystem>>,
}

impl ServerHealth {
    pub fn new(settings: &HealthSettings) -> Self {
        Self {
            publish: settings.publish.build(),
            data_fetch: settings.data_fetch.build(),
            forecast: settings.forecast.build(),
            alerting: Mutex::new(HashSet::new()),
        }
    }

    pub fn monitor(&self, subsystem: Subsystem) -> &dyn HealthMonitor {
        match subsystem {
            Subsystem::Publish => self.publish.as_ref(),
            Subsystem::DataFetch => self.data_fetch.as_ref(),
            Subsystem::Forecast => self.forecast.as_ref(),
        }
    }

    /// Record an outcome and log when the alert condition changes
    pub fn report(&self, subsystem: Subsystem, ok: bool, time: i64) {
        let monitor = self.monitor(subsystem);
        if ok {
            monitor.report_success(time);
        } else {
            monitor.report_failure(time);
        }

        let alert = monitor.check_alert(time);
        let mut alerting = guard(&self.alerting);
        if alert && alerting.insert(subsystem) {
            error!(subsystem = %subsystem, "Health alert raised");
        } else if !alert && alerting.remove(&subsystem) {
            info!(subsystem = %subsystem, "Health alert cleared");
        }
    }

    /// Subsystems currently in alert
    pub fn alerts(&self, time: i64) -> Vec<Subsystem> {
        [Subsystem::Publish, Subsystem::DataFetch, Subsystem::Forecast]
            .into_iter()
            .filter(|&s| self.monitor(s).check_alert(time))
            .collect()
    }

    pub fn reset(&self) {
        self.publish.reset();
        self.data_fetch.reset();
        self.forecast.reset();
        guard(&self.alerting).clear();
    }
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self::new(&HealthSettings::default())
    }
}
