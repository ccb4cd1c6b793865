//! Single-slot human approval gate.
//!
//! At most one proposal is outstanding. A later proposal replaces an earlier
//! one, approving only flips the flag, and the next executor run consumes an
//! approved proposal exactly once, resetting the slot whether or not the
//! materialization succeeds.

use crate::classifier::missing_fields;
use crate::model::FailureEvent;
use crate::store::{DocumentStore, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const APPROVAL_KEY: &str = "approval_state";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalState {
    pub pending_fix: Option<String>,
    pub failure: Option<FailureEvent>,
    pub approved: bool,
}

impl ApprovalState {
    pub fn is_empty(&self) -> bool {
        self.pending_fix.is_none() && self.failure.is_none() && !self.approved
    }
}

/// An approved proposal taken out of the slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub fix_description: String,
    pub failure: Option<FailureEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumedApproval {
    pub fix_description: String,
    pub applied: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("approval state document is malformed: {0}")]
    Malformed(serde_json::Error),
}

/// Applies an approved fix to the world.
pub trait Materializer: Send + Sync {
    fn materialize(&self, pending: &PendingApproval) -> Result<Value, String>;
}

impl<F> Materializer for F
where
    F: Fn(&PendingApproval) -> Result<Value, String> + Send + Sync,
{
    fn materialize(&self, pending: &PendingApproval) -> Result<Value, String> {
        self(pending)
    }
}

pub struct ApprovalGate {
    store: Arc<dyn DocumentStore>,
    slot: Mutex<()>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            slot: Mutex::new(()),
        }
    }

    pub fn state(&self) -> Result<ApprovalState, ApprovalError> {
        let _guard = self.slot.lock();
        self.read()
    }

    /// Last proposal wins; there is no queue.
    pub fn propose(
        &self,
        fix_description: impl Into<String>,
        failure: FailureEvent,
    ) -> Result<(), ApprovalError> {
        let _guard = self.slot.lock();
        let previous = self.read()?;
        if previous.pending_fix.is_some() {
            warn!(
                replaced = previous.pending_fix.as_deref().unwrap_or_default(),
                "pending approval replaced by a newer proposal"
            );
        }
        let state = ApprovalState {
            pending_fix: Some(fix_description.into()),
            failure: Some(failure),
            approved: false,
        };
        info!(fix = state.pending_fix.as_deref().unwrap_or_default(), "fix proposed for approval");
        self.write(&state)
    }

    /// Returns the state after approval. Approving an empty slot is a no-op
    /// and writes nothing.
    pub fn approve(&self) -> Result<ApprovalState, ApprovalError> {
        let _guard = self.slot.lock();
        let mut state = self.read()?;
        if state.pending_fix.is_none() {
            debug!("approval requested with nothing pending");
            return Ok(state);
        }
        state.approved = true;
        self.write(&state)?;
        info!(pending = state.pending_fix.is_some(), "approval granted");
        Ok(state)
    }

    /// Takes an approved proposal out of the slot, resetting it, and only then
    /// runs `apply`. `Ok(None)` when nothing approved is pending.
    pub fn consume_if_approved(
        &self,
        apply: &dyn Materializer,
    ) -> Result<Option<ConsumedApproval>, ApprovalError> {
        let pending = {
            let _guard = self.slot.lock();
            let state = self.read()?;
            let Some(fix_description) = state.pending_fix.filter(|_| state.approved) else {
                return Ok(None);
            };
            self.write(&ApprovalState::default())?;
            PendingApproval {
                fix_description,
                failure: state.failure,
            }
        };

        let consumed = match apply.materialize(&pending) {
            Ok(output) => {
                info!(fix = %pending.fix_description, "approved fix applied");
                ConsumedApproval {
                    fix_description: pending.fix_description,
                    applied: true,
                    output: Some(output),
                    error: None,
                }
            }
            Err(err) => {
                warn!(fix = %pending.fix_description, error = %err, "approved fix could not be applied; approval dropped");
                ConsumedApproval {
                    fix_description: pending.fix_description,
                    applied: false,
                    output: None,
                    error: Some(err),
                }
            }
        };
        Ok(Some(consumed))
    }

    fn read(&self) -> Result<ApprovalState, ApprovalError> {
        match self.store.read(APPROVAL_KEY)? {
            Some(doc) => serde_json::from_value(doc).map_err(ApprovalError::Malformed),
            None => Ok(ApprovalState::default()),
        }
    }

    fn write(&self, state: &ApprovalState) -> Result<(), ApprovalError> {
        let doc = serde_json::to_value(state).map_err(StoreError::from)?;
        self.store.write(APPROVAL_KEY, &doc)?;
        Ok(())
    }
}

/// Fills fields named in the stored failure's `missing required field '<x>'`
/// errors into every record of a JSON array file that lacks them.
pub struct RecordPatcher {
    path: PathBuf,
    default_value: Value,
}

impl RecordPatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            default_value: Value::Null,
        }
    }

    pub fn with_default_value(mut self, value: Value) -> Self {
        self.default_value = value;
        self
    }
}

impl Materializer for RecordPatcher {
    fn materialize(&self, pending: &PendingApproval) -> Result<Value, String> {
        let failure = pending
            .failure
            .as_ref()
            .ok_or_else(|| "approval has no stored failure".to_string())?;
        let fields = missing_fields(&failure.error_message);
        if fields.is_empty() {
            return Err(format!(
                "no missing field named in stored failure: {}",
                failure.error_message
            ));
        }

        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| format!("read {}: {e}", self.path.display()))?;
        let mut records: Vec<Value> = serde_json::from_str(&text)
            .map_err(|e| format!("records at {} are not a json array: {e}", self.path.display()))?;

        let mut patched = 0;
        for record in records.iter_mut() {
            let Some(obj) = record.as_object_mut() else {
                continue;
            };
            let mut touched = false;
            for field in &fields {
                if !obj.contains_key(field) {
                    obj.insert(field.clone(), self.default_value.clone());
                    touched = true;
                }
            }
            if touched {
                patched += 1;
            }
        }

        let body = serde_json::to_vec_pretty(&records).map_err(|e| e.to_string())?;
        std::fs::write(&self.path, body).map_err(|e| format!("write {}: {e}", self.path.display()))?;

        Ok(serde_json::json!({
            "patched_records": patched,
            "fields": fields,
        }))
    }
}
