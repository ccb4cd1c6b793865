//! Fix execution, verification and rollback against the actuator seam.
//!
//! Every attempt ends in a `FixResult`; actuator failures are folded into the
//! result and never escape as errors. Results go to an append-only history
//! and sit in the active index only while the attempt is in flight.

use crate::actuator::{Actuator, ActuatorAction, ActuatorReply};
use crate::approval::{ApprovalGate, ConsumedApproval, Materializer};
use crate::config::ExecutorConfig;
use crate::model::{
    Diagnosis, FailureEvent, FixAction, FixResult, FixStatus, FixType, VerificationResult,
};
use crate::selector::select_fix;
use dashmap::DashMap;
use failure_registry::parse_timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one executor pass did, including approval-gate side effects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub fix: FixResult,
    /// An earlier approved proposal applied at the start of this pass.
    pub consumed_approval: Option<ConsumedApproval>,
    /// Proposal text put up for approval by this pass.
    pub proposed_approval: Option<String>,
    pub approval_errors: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixSummary {
    pub total_fixes_24h: usize,
    pub status_distribution: BTreeMap<String, usize>,
    pub type_distribution: BTreeMap<String, usize>,
    pub success_rate: f64,
    pub timestamp: String,
}

pub struct Executor<A> {
    actuator: Arc<A>,
    config: ExecutorConfig,
    gate: Arc<ApprovalGate>,
    materializer: Arc<dyn Materializer>,
    active: DashMap<String, FixResult>,
    history: Mutex<Vec<FixResult>>,
    seq: AtomicU64,
}

impl<A: Actuator> Executor<A> {
    pub fn new(
        actuator: Arc<A>,
        config: ExecutorConfig,
        gate: Arc<ApprovalGate>,
        materializer: Arc<dyn Materializer>,
    ) -> Self {
        Self {
            actuator,
            config,
            gate,
            materializer,
            active: DashMap::new(),
            history: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub async fn apply(&self, diagnosis: &Diagnosis, event: &FailureEvent) -> ExecutionReport {
        let action = select_fix(diagnosis, event);
        self.run(action, diagnosis, event).await
    }

    /// Runs an already selected action. An approved proposal waiting in the
    /// gate is applied first, whichever event proposed it.
    pub async fn run(
        &self,
        action: FixAction,
        diagnosis: &Diagnosis,
        event: &FailureEvent,
    ) -> ExecutionReport {
        let mut approval_errors = Vec::new();
        let consumed_approval = match self.gate.consume_if_approved(self.materializer.as_ref()) {
            Ok(consumed) => consumed,
            Err(err) => {
                warn!(error = %err, "approval gate unavailable; skipping approved fix");
                approval_errors.push(err.to_string());
                None
            }
        };

        let fix_id = self.next_fix_id(&event.task_id);
        let mut result = FixResult {
            fix_id: fix_id.clone(),
            status: FixStatus::Pending,
            applied_fix: action.clone(),
            start_time: chrono::Utc::now().to_rfc3339(),
            end_time: None,
            success: false,
            error_message: None,
            rollback_applied: false,
            verification_result: None,
        };
        self.active.insert(fix_id.clone(), result.clone());
        result.status = FixStatus::InProgress;
        self.active.insert(fix_id.clone(), result.clone());

        info!(
            %fix_id,
            fix_type = action.fix_type.as_str(),
            task_id = %event.task_id,
            "applying fix"
        );
        let outcome = self.dispatch(&action).await;
        result.end_time = Some(chrono::Utc::now().to_rfc3339());

        match outcome {
            Ok(()) => {
                result.status = FixStatus::Success;
                result.success = true;
                let verification = self.verify(&action, event).await;
                info!(%fix_id, verified = verification.verified, "fix applied");
                result.verification_result = Some(verification);
            }
            Err(message) => {
                error!(%fix_id, error = %message, "fix failed");
                result.status = FixStatus::Failed;
                result.error_message = Some(message);
            }
        }

        self.history.lock().push(result.clone());
        self.active.remove(&fix_id);

        let mut proposed_approval = None;
        if action.fix_type == FixType::ManualIntervention {
            let proposal = diagnosis
                .suggested_fixes
                .first()
                .cloned()
                .unwrap_or_else(|| action.description.clone());
            match self.gate.propose(proposal.clone(), event.clone()) {
                Ok(()) => proposed_approval = Some(proposal),
                Err(err) => {
                    warn!(error = %err, "could not record approval proposal");
                    approval_errors.push(err.to_string());
                }
            }
        }

        ExecutionReport {
            fix: result,
            consumed_approval,
            proposed_approval,
            approval_errors,
        }
    }

    /// `false` when the id is unknown or the rollback call fails. Rolling back
    /// twice re-sends the same recorded plan.
    pub async fn rollback(&self, fix_id: &str) -> bool {
        let applied = self
            .history
            .lock()
            .iter()
            .find(|fix| fix.fix_id == fix_id)
            .map(|fix| fix.applied_fix.clone());
        let Some(applied) = applied else {
            warn!(%fix_id, "rollback requested for unknown fix");
            return false;
        };

        info!(%fix_id, plan = %applied.rollback_plan, "rolling back fix");
        let payload = json!({
            "fix_type": applied.fix_type.as_str(),
            "rollback_plan": applied.rollback_plan,
            "parameters": applied.parameters,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(message) = self.call(ActuatorAction::Rollback, payload).await {
            error!(%fix_id, error = %message, "rollback failed");
            return false;
        }

        let mut history = self.history.lock();
        if let Some(fix) = history.iter_mut().find(|fix| fix.fix_id == fix_id) {
            fix.status = FixStatus::RolledBack;
            fix.rollback_applied = true;
        }
        true
    }

    pub fn find(&self, fix_id: &str) -> Option<FixResult> {
        self.history
            .lock()
            .iter()
            .find(|fix| fix.fix_id == fix_id)
            .cloned()
    }

    pub fn history(&self) -> Vec<FixResult> {
        self.history.lock().clone()
    }

    pub fn active_fixes(&self) -> Vec<FixResult> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn fix_summary(&self) -> FixSummary {
        let now = chrono::Utc::now();
        let cutoff = now - chrono::Duration::hours(24);
        let history = self.history.lock();
        let recent: Vec<&FixResult> = history
            .iter()
            .filter(|fix| parse_timestamp(&fix.start_time).is_some_and(|ts| ts > cutoff))
            .collect();

        let mut status_distribution = BTreeMap::new();
        let mut type_distribution = BTreeMap::new();
        for fix in &recent {
            *status_distribution
                .entry(fix.status.as_str().to_string())
                .or_insert(0) += 1;
            *type_distribution
                .entry(fix.applied_fix.fix_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        let succeeded = recent.iter().filter(|fix| fix.success).count();
        let success_rate = if recent.is_empty() {
            0.0
        } else {
            succeeded as f64 / recent.len() as f64
        };

        FixSummary {
            total_fixes_24h: recent.len(),
            status_distribution,
            type_distribution,
            success_rate,
            timestamp: now.to_rfc3339(),
        }
    }

    fn next_fix_id(&self, task_id: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "fix_{}_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            seq,
            task_id
        )
    }

    async fn dispatch(&self, action: &FixAction) -> Result<(), String> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let target = ActuatorAction::for_fix(action.fix_type);
        let payload = match action.fix_type {
            FixType::SchemaUpdate => json!({
                "dag_id": action.parameters.get("dag_id"),
                "task_id": action.parameters.get("task_id"),
                "action": "update_schema",
                "timestamp": timestamp,
            }),
            FixType::DataTransformation => json!({
                "transform_type": action
                    .parameters
                    .get("transform_type")
                    .cloned()
                    .unwrap_or_else(|| json!("unknown")),
                "parameters": action.parameters,
                "timestamp": timestamp,
            }),
            FixType::RetryTask | FixType::ConfigUpdate | FixType::ManualIntervention => json!({
                "parameters": action.parameters,
                "timestamp": timestamp,
            }),
        };
        self.call(target, payload).await.map(|_| ())
    }

    async fn verify(&self, action: &FixAction, event: &FailureEvent) -> VerificationResult {
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        let payload = json!({
            "dag_id": event.dag_id,
            "task_id": event.task_id,
            "fix_type": action.fix_type.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        match self.call_raw(ActuatorAction::VerifyFix, payload).await {
            Ok(reply) if !reply.is_success() => VerificationResult {
                verified: false,
                verification_method: "api_check".into(),
                details: None,
                error: Some(format!("Verification failed with status {}", reply.status)),
            },
            Ok(ActuatorReply { body: Some(body), .. }) => VerificationResult {
                verified: true,
                verification_method: "api_check".into(),
                details: Some(body),
                error: None,
            },
            Ok(_) => VerificationResult {
                verified: false,
                verification_method: "api_check".into(),
                details: None,
                error: Some("verification response carried no JSON payload".into()),
            },
            Err(message) => VerificationResult {
                verified: false,
                verification_method: "error".into(),
                details: None,
                error: Some(message),
            },
        }
    }

    /// Success means a 2xx answer within the configured timeout.
    async fn call(&self, action: ActuatorAction, payload: Value) -> Result<Option<Value>, String> {
        let reply = self.call_raw(action, payload).await?;
        if reply.is_success() {
            Ok(reply.body)
        } else {
            Err(format!("{} answered with status {}", action.path(), reply.status))
        }
    }

    async fn call_raw(
        &self,
        action: ActuatorAction,
        payload: Value,
    ) -> Result<ActuatorReply, String> {
        debug!(action = action.path(), "actuator request");
        let timeout = self.config.actuator_timeout;
        match tokio::time::timeout(timeout, self.actuator.call(action, payload)).await {
            Ok(Ok(reply)) => {
                debug!(action = action.path(), status = reply.status, "actuator reply");
                Ok(reply)
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("{} timed out after {timeout:?}", action.path())),
        }
    }
}
