//! The remediation loop: Monitor → Diagnoser → Selector → Executor for every
//! incoming failure, with each stage's failure confined to its own error
//! entry in the outcome.

use crate::actuator::Actuator;
use crate::approval::{
    ApprovalError, ApprovalGate, ApprovalState, ConsumedApproval, RecordPatcher, APPROVAL_KEY,
};
use crate::classifier::PatternClassifier;
use crate::config::{ApprovalStoreKind, HealerConfig};
use crate::diagnoser::{Diagnoser, DiagnosisEngine, DiagnosisSource, DiagnosisSummary};
use crate::event_log::{Event, EventLog, EventType};
use crate::executor::{Executor, FixSummary};
use crate::llm::ModelClassifier;
use crate::model::{Diagnosis, FailureEvent, FixResult};
use crate::monitor::{FailureSummary, MonitorReport, SeverityMonitor};
use crate::selector::select_fix;
use crate::store::{DocumentStore, JsonFileStore, MemoryStore, SqliteStore, StoreError};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

const RECENT_RUNS: usize = 20;
const PROMPT_HISTORY: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Monitor,
    Diagnosis,
    Selection,
    Execution,
    Approval,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Monitor => "monitor",
            Stage::Diagnosis => "diagnosis",
            Stage::Selection => "selection",
            Stage::Execution => "execution",
            Stage::Approval => "approval",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

impl StageError {
    fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub monitor_ms: u64,
    pub diagnosis_ms: Option<u64>,
    pub execution_ms: Option<u64>,
    pub total_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalActivity {
    pub consumed: Option<ConsumedApproval>,
    pub proposed: Option<String>,
}

/// Composite result of one pass. Always produced, whatever failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub event: FailureEvent,
    pub monitor: Option<MonitorReport>,
    pub diagnosis: Option<Diagnosis>,
    pub diagnosis_source: Option<DiagnosisSource>,
    pub fix: Option<FixResult>,
    pub approval: ApprovalActivity,
    pub timings: StageTimings,
    pub errors: Vec<StageError>,
    pub timestamp: String,
}

impl RemediationOutcome {
    pub fn failed_stages(&self) -> Vec<Stage> {
        self.errors.iter().map(|e| e.stage).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopSummary {
    pub failures: FailureSummary,
    pub diagnoses: DiagnosisSummary,
    pub fixes: FixSummary,
    pub active_fixes: Vec<FixResult>,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("approval store: {0}")]
    Store(#[from] StoreError),
    #[error("event log: {0}")]
    EventLog(String),
}

pub struct RemediationLoop<A> {
    monitor: SeverityMonitor,
    diagnoser: Diagnoser,
    executor: Executor<A>,
    event_log: Option<EventLog>,
    runs: Mutex<VecDeque<RemediationOutcome>>,
}

impl<A: Actuator> RemediationLoop<A> {
    pub fn new(monitor: SeverityMonitor, diagnoser: Diagnoser, executor: Executor<A>) -> Self {
        Self {
            monitor,
            diagnoser,
            executor,
            event_log: None,
            runs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Wires every stage from configuration around the given actuator.
    pub fn from_config(config: &HealerConfig, actuator: Arc<A>) -> Result<Self, BuildError> {
        let store: Arc<dyn DocumentStore> = match &config.approval_store {
            ApprovalStoreKind::File(path) => Arc::new(JsonFileStore::single(APPROVAL_KEY, path)),
            ApprovalStoreKind::Sqlite(path) => Arc::new(SqliteStore::open(path)?),
            ApprovalStoreKind::Memory => Arc::new(MemoryStore::new()),
        };
        let gate = Arc::new(ApprovalGate::new(store));
        let executor = Executor::new(
            actuator,
            config.executor.clone(),
            gate,
            Arc::new(RecordPatcher::new(&config.records_path)),
        );

        let engine = match &config.llm {
            Some(llm) => DiagnosisEngine::ModelBacked(ModelClassifier::new(
                llm.clone(),
                config.executor.actuator_timeout,
            )),
            None => DiagnosisEngine::Pattern(PatternClassifier),
        };

        let mut healer = Self::new(
            SeverityMonitor::new(config.monitor.clone()),
            Diagnoser::new(engine),
            executor,
        );
        if let Some(path) = &config.event_log_path {
            healer = healer.with_event_log(EventLog::open(path).map_err(BuildError::EventLog)?);
        }
        Ok(healer)
    }

    pub fn executor(&self) -> &Executor<A> {
        &self.executor
    }

    pub fn event_log(&self) -> Option<&EventLog> {
        self.event_log.as_ref()
    }

    pub async fn handle(&self, event: FailureEvent) -> RemediationOutcome {
        let started = Instant::now();
        let task_key = event.task_key();
        let mut errors = Vec::new();
        let mut timings = StageTimings::default();
        let mut approval = ApprovalActivity::default();

        info!(
            task = %task_key,
            error_type = %event.error_type,
            retry_count = event.retry_count,
            "failure received"
        );
        self.record(
            Event::new(&task_key, EventType::FailureReceived, "failure received")
                .with_details(json!(event)),
        );

        let stage_start = Instant::now();
        let monitor = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.monitor.process_failure(&event)
        })) {
            Ok(Ok(report)) => Some(report),
            Ok(Err(err)) => {
                errors.push(StageError::new(Stage::Monitor, err.to_string()));
                None
            }
            Err(panic) => {
                errors.push(StageError::new(Stage::Monitor, panic_message(panic)));
                None
            }
        };
        timings.monitor_ms = elapsed_ms(stage_start);

        // Without a monitor verdict the pass still diagnoses, but never acts.
        let remediate = match monitor.as_ref().map(|report| report.should_intervene) {
            Some(true) => true,
            Some(false) => {
                self.record(
                    Event::new(&task_key, EventType::InterventionSkipped, "monitored only")
                        .with_details(json!(monitor)),
                );
                return self.finish(
                    RemediationOutcome {
                        event,
                        monitor,
                        diagnosis: None,
                        diagnosis_source: None,
                        fix: None,
                        approval,
                        timings,
                        errors,
                        timestamp: String::new(),
                    },
                    started,
                );
            }
            None => false,
        };

        let stage_start = Instant::now();
        let history = self.monitor.recent_history(&event.task_id, PROMPT_HISTORY);
        let (diagnosis, diagnosis_source) =
            match AssertUnwindSafe(self.diagnoser.diagnose(&event, &history))
                .catch_unwind()
                .await
            {
                Ok((diagnosis, source)) => {
                    self.record(
                        Event::new(&task_key, EventType::DiagnosisProduced, &diagnosis.root_cause)
                            .with_details(json!({"diagnosis": diagnosis, "source": source})),
                    );
                    (Some(diagnosis), Some(source))
                }
                Err(panic) => {
                    errors.push(StageError::new(Stage::Diagnosis, panic_message(panic)));
                    (None, None)
                }
            };
        timings.diagnosis_ms = Some(elapsed_ms(stage_start));

        let mut fix = None;
        if let (true, Some(diagnosis)) = (remediate, diagnosis.as_ref()) {
            let stage_start = Instant::now();
            match std::panic::catch_unwind(AssertUnwindSafe(|| select_fix(diagnosis, &event))) {
                Ok(action) => {
                    self.record(
                        Event::new(&task_key, EventType::FixSelected, &action.description)
                            .with_details(json!(action)),
                    );
                    match AssertUnwindSafe(self.executor.run(action, diagnosis, &event))
                        .catch_unwind()
                        .await
                    {
                        Ok(report) => {
                            self.record_fix(&task_key, &report.fix);
                            if let Some(consumed) = &report.consumed_approval {
                                self.record(
                                    Event::new(
                                        &task_key,
                                        EventType::ApprovalConsumed,
                                        &consumed.fix_description,
                                    )
                                    .with_details(json!(consumed)),
                                );
                            }
                            if let Some(proposal) = &report.proposed_approval {
                                self.record(Event::new(
                                    &task_key,
                                    EventType::ApprovalProposed,
                                    proposal,
                                ));
                            }
                            errors.extend(
                                report
                                    .approval_errors
                                    .iter()
                                    .map(|message| StageError::new(Stage::Approval, message.clone())),
                            );
                            approval = ApprovalActivity {
                                consumed: report.consumed_approval,
                                proposed: report.proposed_approval,
                            };
                            fix = Some(report.fix);
                        }
                        Err(panic) => {
                            errors.push(StageError::new(Stage::Execution, panic_message(panic)));
                        }
                    }
                }
                Err(panic) => {
                    errors.push(StageError::new(Stage::Selection, panic_message(panic)));
                }
            }
            timings.execution_ms = Some(elapsed_ms(stage_start));
        }

        self.finish(
            RemediationOutcome {
                event,
                monitor,
                diagnosis,
                diagnosis_source,
                fix,
                approval,
                timings,
                errors,
                timestamp: String::new(),
            },
            started,
        )
    }

    pub fn resolve(&self, dag_id: &str, task_id: &str) -> bool {
        let resolved = self.monitor.mark_resolved(dag_id, task_id);
        if resolved {
            self.record(Event::new(
                format!("{dag_id}/{task_id}"),
                EventType::FailureResolved,
                "failure resolved",
            ));
        }
        resolved
    }

    pub async fn rollback(&self, fix_id: &str) -> bool {
        let rolled_back = self.executor.rollback(fix_id).await;
        if rolled_back {
            if let Some(fix) = self.executor.find(fix_id) {
                self.record(
                    Event::new(
                        fix_task_key(&fix),
                        EventType::FixRolledBack,
                        &fix.applied_fix.rollback_plan,
                    )
                    .with_details(json!({"fix_id": fix_id})),
                );
            }
        }
        rolled_back
    }

    pub fn approve(&self) -> Result<ApprovalState, ApprovalError> {
        let state = self.executor.gate().approve()?;
        if !state.approved {
            return Ok(state);
        }
        let task_key = state
            .failure
            .as_ref()
            .map(FailureEvent::task_key)
            .unwrap_or_else(|| "approval".into());
        self.record(
            Event::new(task_key, EventType::ApprovalApproved, "approval granted")
                .with_details(json!(state)),
        );
        Ok(state)
    }

    pub fn approval_state(&self) -> Result<ApprovalState, ApprovalError> {
        self.executor.gate().state()
    }

    pub fn approval_gate(&self) -> &ApprovalGate {
        self.executor.gate()
    }

    /// Most recent passes, oldest first.
    pub fn recent_runs(&self) -> Vec<RemediationOutcome> {
        self.runs.lock().iter().cloned().collect()
    }

    pub fn summary(&self) -> LoopSummary {
        LoopSummary {
            failures: self.monitor.failure_summary(),
            diagnoses: self.diagnoser.diagnosis_summary(),
            fixes: self.executor.fix_summary(),
            active_fixes: self.executor.active_fixes(),
        }
    }

    /// Audit events for one task; empty when no event log is configured.
    pub fn timeline(&self, dag_id: &str, task_id: &str) -> Result<Vec<Event>, String> {
        match &self.event_log {
            Some(log) => log.events_for_task(&format!("{dag_id}/{task_id}")),
            None => Ok(Vec::new()),
        }
    }

    fn finish(&self, mut outcome: RemediationOutcome, started: Instant) -> RemediationOutcome {
        outcome.timings.total_ms = elapsed_ms(started);
        outcome.timestamp = chrono::Utc::now().to_rfc3339();
        for stage_error in &outcome.errors {
            error!(stage = stage_error.stage.as_str(), error = %stage_error.message, "stage failed");
            self.record(
                Event::new(outcome.event.task_key(), EventType::StageFailed, &stage_error.message)
                    .with_details(json!(stage_error)),
            );
        }

        let mut runs = self.runs.lock();
        runs.push_back(outcome.clone());
        while runs.len() > RECENT_RUNS {
            runs.pop_front();
        }
        outcome
    }

    fn record_fix(&self, task_key: &str, fix: &FixResult) {
        let (event_type, description) = if fix.success {
            (EventType::FixApplied, format!("fix applied: {}", fix.applied_fix.description))
        } else {
            (
                EventType::FixFailed,
                format!(
                    "fix failed: {}",
                    fix.error_message.as_deref().unwrap_or("unknown error")
                ),
            )
        };
        self.record(Event::new(task_key, event_type, description).with_details(json!(fix)));

        if let Some(verification) = fix.verification_result.as_ref().filter(|v| v.verified) {
            self.record(
                Event::new(task_key, EventType::FixVerified, "fix verified")
                    .with_details(json!(verification)),
            );
        }
    }

    fn record(&self, event: Event) {
        let Some(log) = &self.event_log else {
            return;
        };
        if let Err(err) = log.append(&event) {
            warn!(error = %err, "event log append failed");
        }
    }
}

fn fix_task_key(fix: &FixResult) -> String {
    let params = &fix.applied_fix.parameters;
    match (
        params.get("dag_id").and_then(|v| v.as_str()),
        params.get("task_id").and_then(|v| v.as_str()),
    ) {
        (Some(dag_id), Some(task_id)) => format!("{dag_id}/{task_id}"),
        _ => format!("fix/{}", fix.fix_id),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}
