//! Severity monitor: rolling per-task failure history and the decision of
//! whether a failure deserves automated attention.

use crate::config::MonitorConfig;
use crate::model::{FailureEvent, Severity};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use failure_registry::parse_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredFailure {
    pub event: FailureEvent,
    pub severity: Severity,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    InterventionTriggered,
    Monitored,
}

/// Which intervention rule fired, in precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionReason {
    CriticalSeverity,
    HighSeverity,
    RecurringFailures,
    SchemaValidation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub status: MonitorStatus,
    pub severity: Severity,
    pub should_intervene: bool,
    pub reason: Option<InterventionReason>,
    /// Unresolved failures of the same task already in the window.
    pub prior_recent_failures: usize,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub total_failures: usize,
    pub severity_distribution: BTreeMap<String, usize>,
    pub unresolved_failures: usize,
    pub timestamp: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorError {
    #[error("failure event has no task_id")]
    MissingTaskId,
}

pub struct SeverityMonitor {
    config: MonitorConfig,
    /// One bucket per task id; the shard lock serializes each bucket's
    /// read-modify-write.
    history: DashMap<String, Vec<MonitoredFailure>>,
}

impl SeverityMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            history: DashMap::new(),
        }
    }

    pub fn process_failure(&self, event: &FailureEvent) -> Result<MonitorReport, MonitorError> {
        self.process_failure_at(event, Utc::now())
    }

    pub fn process_failure_at(
        &self,
        event: &FailureEvent,
        now: DateTime<Utc>,
    ) -> Result<MonitorReport, MonitorError> {
        if event.task_id.trim().is_empty() {
            return Err(MonitorError::MissingTaskId);
        }
        let cutoff = self.cutoff(now);

        let mut bucket = self.history.entry(event.task_id.clone()).or_default();
        let prior_recent = bucket.iter().filter(|f| is_recent(&f.event, cutoff)).count();

        // The failure being processed counts toward the consecutive run only
        // when it falls inside the window itself.
        let consecutive = prior_recent + usize::from(within_window(event, cutoff));
        let severity = self.compute_severity(event, consecutive);
        let reason = intervention_reason(event, severity, prior_recent);

        bucket.retain(|f| !is_expired(&f.event, cutoff));
        bucket.push(MonitoredFailure {
            event: event.clone(),
            severity,
        });
        drop(bucket);

        let should_intervene = reason.is_some();
        if should_intervene {
            info!(
                dag_id = %event.dag_id,
                task_id = %event.task_id,
                severity = severity.as_str(),
                ?reason,
                "intervention triggered"
            );
        } else {
            debug!(
                dag_id = %event.dag_id,
                task_id = %event.task_id,
                severity = severity.as_str(),
                "failure monitored without intervention"
            );
        }

        Ok(MonitorReport {
            status: if should_intervene {
                MonitorStatus::InterventionTriggered
            } else {
                MonitorStatus::Monitored
            },
            severity,
            should_intervene,
            reason,
            prior_recent_failures: prior_recent,
            timestamp: now.to_rfc3339(),
        })
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.config.time_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn compute_severity(&self, event: &FailureEvent, consecutive: usize) -> Severity {
        let mut severity = base_severity(&event.error_type);
        if event.retry_count >= 3 {
            severity = severity.max(Severity::High);
        }
        if consecutive >= self.config.consecutive_failures {
            severity = Severity::Critical;
        }
        severity
    }

    /// Marks the most recent failure of `dag_id`/`task_id` as resolved.
    pub fn mark_resolved(&self, dag_id: &str, task_id: &str) -> bool {
        let Some(mut bucket) = self.history.get_mut(task_id) else {
            return false;
        };
        match bucket.iter_mut().rev().find(|f| f.event.dag_id == dag_id) {
            Some(failure) => {
                failure.event.resolved = true;
                info!(dag_id, task_id, "failure marked resolved");
                true
            }
            None => false,
        }
    }

    /// Last `limit` failures recorded for a task, oldest first.
    pub fn recent_history(&self, task_id: &str, limit: usize) -> Vec<FailureEvent> {
        let Some(bucket) = self.history.get(task_id) else {
            return Vec::new();
        };
        let skip = bucket.len().saturating_sub(limit);
        bucket.iter().skip(skip).map(|f| f.event.clone()).collect()
    }

    pub fn failure_summary(&self) -> FailureSummary {
        let now = Utc::now();
        let cutoff = self.cutoff(now);
        let mut total = 0;
        let mut unresolved = 0;
        let mut distribution = BTreeMap::new();

        for bucket in self.history.iter() {
            for failure in bucket.value() {
                if !within_window(&failure.event, cutoff) {
                    continue;
                }
                total += 1;
                if !failure.event.resolved {
                    unresolved += 1;
                }
                *distribution
                    .entry(failure.severity.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        FailureSummary {
            total_failures: total,
            severity_distribution: distribution,
            unresolved_failures: unresolved,
            timestamp: now.to_rfc3339(),
        }
    }
}

impl Default for SeverityMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

fn base_severity(error_type: &str) -> Severity {
    let error_type = error_type.to_lowercase();
    if error_type.contains("connection") || error_type.contains("timeout") {
        Severity::High
    } else {
        // schema/validation and everything unrecognized
        Severity::Medium
    }
}

fn intervention_reason(
    event: &FailureEvent,
    severity: Severity,
    prior_recent: usize,
) -> Option<InterventionReason> {
    if severity == Severity::Critical {
        Some(InterventionReason::CriticalSeverity)
    } else if severity == Severity::High {
        Some(InterventionReason::HighSeverity)
    } else if prior_recent >= 2 {
        Some(InterventionReason::RecurringFailures)
    } else if event.error_type == "schema_validation" {
        Some(InterventionReason::SchemaValidation)
    } else {
        None
    }
}

fn within_window(event: &FailureEvent, cutoff: DateTime<Utc>) -> bool {
    parse_timestamp(&event.timestamp).is_some_and(|ts| ts > cutoff)
}

fn is_recent(event: &FailureEvent, cutoff: DateTime<Utc>) -> bool {
    !event.resolved && within_window(event, cutoff)
}

fn is_expired(event: &FailureEvent, cutoff: DateTime<Utc>) -> bool {
    parse_timestamp(&event.timestamp).is_some_and(|ts| ts <= cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(task_id: &str, error_type: &str, retry_count: u32) -> FailureEvent {
        FailureEvent {
            dag_id: "etl".into(),
            task_id: task_id.into(),
            execution_date: "2024-01-01T00:00:00".into(),
            error_message: "Task failed".into(),
            error_type: error_type.into(),
            timestamp: Utc::now().to_rfc3339(),
            retry_count,
            resolved: false,
        }
    }

    #[test]
    fn connection_errors_start_high() {
        let monitor = SeverityMonitor::default();
        let report = monitor
            .process_failure(&event("load", "connection_error", 0))
            .expect("report");
        assert_eq!(report.severity, Severity::High);
        assert_eq!(report.reason, Some(InterventionReason::HighSeverity));
        assert_eq!(report.status, MonitorStatus::InterventionTriggered);
    }

    #[test]
    fn retry_count_raises_to_high() {
        let monitor = SeverityMonitor::default();
        let report = monitor
            .process_failure(&event("load", "unknown", 3))
            .expect("report");
        assert_eq!(report.severity, Severity::High);
        assert!(report.should_intervene);
    }

    #[test]
    fn third_unresolved_failure_is_critical_for_any_error_type() {
        let monitor = SeverityMonitor::default();
        for _ in 0..2 {
            monitor
                .process_failure(&event("load", "connection_error", 0))
                .expect("report");
        }
        let report = monitor
            .process_failure(&event("load", "whatever", 0))
            .expect("report");
        assert_eq!(report.severity, Severity::Critical);
        assert_eq!(report.reason, Some(InterventionReason::CriticalSeverity));
    }

    #[test]
    fn second_medium_failure_is_only_monitored_third_intervenes() {
        let monitor = SeverityMonitor::default();
        let first = monitor.process_failure(&event("load", "unknown", 0)).expect("first");
        let second = monitor.process_failure(&event("load", "unknown", 0)).expect("second");
        assert!(!first.should_intervene);
        assert_eq!(second.severity, Severity::Medium);
        assert!(!second.should_intervene);
        assert_eq!(second.status, MonitorStatus::Monitored);

        let third = monitor.process_failure(&event("load", "unknown", 0)).expect("third");
        assert!(third.should_intervene);
    }

    #[test]
    fn recurring_failures_rule_fires_below_critical_threshold() {
        let monitor = SeverityMonitor::new(MonitorConfig {
            time_window: chrono::Duration::hours(24),
            consecutive_failures: 10,
        });
        monitor.process_failure(&event("load", "unknown", 0)).expect("1");
        monitor.process_failure(&event("load", "unknown", 0)).expect("2");
        let third = monitor.process_failure(&event("load", "unknown", 0)).expect("3");
        assert_eq!(third.severity, Severity::Medium);
        assert_eq!(third.reason, Some(InterventionReason::RecurringFailures));
        assert_eq!(third.prior_recent_failures, 2);
    }

    #[test]
    fn schema_validation_intervenes_on_first_failure() {
        let monitor = SeverityMonitor::default();
        let report = monitor
            .process_failure(&event("validate_schema", "schema_validation", 0))
            .expect("report");
        assert_eq!(report.severity, Severity::Medium);
        assert_eq!(report.reason, Some(InterventionReason::SchemaValidation));
    }

    #[test]
    fn resolved_and_stale_failures_do_not_count() {
        let monitor = SeverityMonitor::default();
        let mut stale = event("load", "unknown", 0);
        stale.timestamp = (Utc::now() - chrono::Duration::hours(30)).to_rfc3339();
        monitor.process_failure(&stale).expect("stale");
        monitor.process_failure(&event("load", "unknown", 0)).expect("fresh");
        assert!(monitor.mark_resolved("etl", "load"));

        let report = monitor.process_failure(&event("load", "unknown", 0)).expect("next");
        assert_eq!(report.prior_recent_failures, 0);
        assert!(!report.should_intervene);
    }

    #[test]
    fn late_failure_outside_window_does_not_complete_the_critical_run() {
        let monitor = SeverityMonitor::default();
        monitor.process_failure(&event("load", "unknown", 0)).expect("first");
        monitor.process_failure(&event("load", "unknown", 0)).expect("second");

        let mut late = event("load", "unknown", 0);
        late.timestamp = (Utc::now() - chrono::Duration::hours(48)).to_rfc3339();
        let report = monitor.process_failure(&late).expect("late");
        assert_eq!(report.prior_recent_failures, 2);
        assert_eq!(report.severity, Severity::Medium);
        assert_eq!(report.reason, Some(InterventionReason::RecurringFailures));
    }

    #[test]
    fn window_reaching_before_representable_time_counts_everything() {
        let monitor = SeverityMonitor::new(MonitorConfig {
            time_window: chrono::Duration::hours(2_000_000_000_000),
            consecutive_failures: 3,
        });
        monitor.process_failure(&event("load", "unknown", 0)).expect("first");
        let report = monitor.process_failure(&event("load", "unknown", 0)).expect("second");
        assert_eq!(report.prior_recent_failures, 1);
        assert_eq!(monitor.failure_summary().total_failures, 2);
    }

    #[test]
    fn history_is_appended_even_without_intervention() {
        let monitor = SeverityMonitor::default();
        monitor.process_failure(&event("load", "unknown", 0)).expect("report");
        assert_eq!(monitor.recent_history("load", 10).len(), 1);
        assert_eq!(monitor.failure_summary().total_failures, 1);
        assert_eq!(
            monitor.failure_summary().severity_distribution.get("medium"),
            Some(&1)
        );
    }

    #[test]
    fn mark_resolved_without_match_returns_false() {
        let monitor = SeverityMonitor::default();
        assert!(!monitor.mark_resolved("etl", "missing"));
        monitor.process_failure(&event("load", "unknown", 0)).expect("report");
        assert!(!monitor.mark_resolved("other_dag", "load"));
    }

    #[test]
    fn blank_task_id_is_rejected() {
        let monitor = SeverityMonitor::default();
        assert_eq!(
            monitor.process_failure(&event(" ", "unknown", 0)),
            Err(MonitorError::MissingTaskId)
        );
    }
}
