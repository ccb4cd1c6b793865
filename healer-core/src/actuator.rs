//! Outbound actuator seam: the named HTTP actions the executor asks the
//! pipeline platform to perform.

use crate::model::FixType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorAction {
    UpdateSchema,
    AddTransformation,
    RetryTask,
    UpdateConfig,
    Notify,
    VerifyFix,
    Rollback,
}

impl ActuatorAction {
    pub fn path(&self) -> &'static str {
        match self {
            ActuatorAction::UpdateSchema => "update_schema",
            ActuatorAction::AddTransformation => "add_transformation",
            ActuatorAction::RetryTask => "retry_task",
            ActuatorAction::UpdateConfig => "update_config",
            ActuatorAction::Notify => "notify",
            ActuatorAction::VerifyFix => "verify_fix",
            ActuatorAction::Rollback => "rollback",
        }
    }

    pub fn for_fix(fix_type: FixType) -> Self {
        match fix_type {
            FixType::SchemaUpdate => ActuatorAction::UpdateSchema,
            FixType::DataTransformation => ActuatorAction::AddTransformation,
            FixType::RetryTask => ActuatorAction::RetryTask,
            FixType::ConfigUpdate => ActuatorAction::UpdateConfig,
            FixType::ManualIntervention => ActuatorAction::Notify,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActuatorReply {
    pub status: u16,
    pub body: Option<Value>,
}

impl ActuatorReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("actuator call timed out after {0:?}")]
    Timeout(Duration),
    #[error("actuator transport error: {0}")]
    Transport(String),
    #[error("actuator client error: {0}")]
    Client(String),
}

pub trait Actuator: Send + Sync + 'static {
    fn call(
        &self,
        action: ActuatorAction,
        payload: Value,
    ) -> impl Future<Output = Result<ActuatorReply, ActuatorError>> + Send;
}

/// POSTs JSON to `{base_url}/api/<action>`.
pub struct HttpActuator {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpActuator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ActuatorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ActuatorError::Client(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn endpoint(&self, action: ActuatorAction) -> String {
        format!("{}/api/{}", self.base_url, action.path())
    }
}

impl Actuator for HttpActuator {
    fn call(
        &self,
        action: ActuatorAction,
        payload: Value,
    ) -> impl Future<Output = Result<ActuatorReply, ActuatorError>> + Send {
        let url = self.endpoint(action);
        let request = self.client.post(url.clone()).json(&payload);
        let timeout = self.timeout;
        async move {
            debug!(%url, "calling actuator");
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    ActuatorError::Timeout(timeout)
                } else {
                    ActuatorError::Transport(e.to_string())
                }
            })?;
            let status = response.status().as_u16();
            let body = response.json::<Value>().await.ok();
            Ok(ActuatorReply { status, body })
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub action: ActuatorAction,
    pub payload: Value,
}

/// In-process actuator: answers 200 unless scripted otherwise and records
/// every call it receives.
#[derive(Clone, Default)]
pub struct SimulatedActuator {
    statuses: Arc<Mutex<HashMap<ActuatorAction, u16>>>,
    unreachable: Arc<Mutex<HashSet<ActuatorAction>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_with(&self, action: ActuatorAction, status: u16) {
        self.statuses.lock().insert(action, status);
    }

    /// Calls to `action` fail at the transport level.
    pub fn make_unreachable(&self, action: ActuatorAction) {
        self.unreachable.lock().insert(action);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, action: ActuatorAction) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.action == action)
            .cloned()
            .collect()
    }

    fn answer(&self, action: ActuatorAction, payload: Value) -> Result<ActuatorReply, ActuatorError> {
        self.calls.lock().push(RecordedCall { action, payload });
        if self.unreachable.lock().contains(&action) {
            return Err(ActuatorError::Transport(format!(
                "simulated outage for {}",
                action.path()
            )));
        }
        let mut reply = ActuatorReply {
            status: self.statuses.lock().get(&action).copied().unwrap_or(200),
            body: None,
        };
        reply.body = Some(serde_json::json!({
            "status": if reply.is_success() { "ok" } else { "error" },
            "action": action.path(),
        }));
        Ok(reply)
    }
}

impl Actuator for SimulatedActuator {
    fn call(
        &self,
        action: ActuatorAction,
        payload: Value,
    ) -> impl Future<Output = Result<ActuatorReply, ActuatorError>> + Send {
        let reply = self.answer(action, payload);
        async move { reply }
    }
}
