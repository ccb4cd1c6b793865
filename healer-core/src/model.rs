use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One reported task failure. Only `resolved` changes after intake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub dag_id: String,
    pub task_id: String,
    pub execution_date: String,
    pub error_message: String,
    pub error_type: String,
    pub timestamp: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub resolved: bool,
}

impl FailureEvent {
    pub fn task_key(&self) -> String {
        format!("{}/{}", self.dag_id, self.task_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RemediationSafety {
    Safe,
    Risky,
    Unsafe,
}

impl RemediationSafety {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationSafety::Safe => "safe",
            RemediationSafety::Risky => "risky",
            RemediationSafety::Unsafe => "unsafe",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause: String,
    pub confidence: Confidence,
    /// Ordered by preference.
    pub suggested_fixes: Vec<String>,
    pub remediation_safety: RemediationSafety,
    pub reasoning: String,
    pub requires_human_review: bool,
    pub timestamp: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    SchemaUpdate,
    DataTransformation,
    RetryTask,
    ConfigUpdate,
    ManualIntervention,
}

impl FixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixType::SchemaUpdate => "schema_update",
            FixType::DataTransformation => "data_transformation",
            FixType::RetryTask => "retry_task",
            FixType::ConfigUpdate => "config_update",
            FixType::ManualIntervention => "manual_intervention",
        }
    }
}

/// Per-strategy safety as declared by the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Safe,
    Risky,
    Unsafe,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixAction {
    pub fix_type: FixType,
    pub description: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub safety_level: SafetyLevel,
    pub estimated_duration_seconds: u64,
    pub rollback_plan: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    RolledBack,
}

impl FixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixStatus::Pending => "pending",
            FixStatus::InProgress => "in_progress",
            FixStatus::Success => "success",
            FixStatus::Failed => "failed",
            FixStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FixStatus::Success | FixStatus::Failed | FixStatus::RolledBack)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    /// `api_check` when the verify endpoint answered, `error` on transport failure.
    pub verification_method: String,
    pub details: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    pub fix_id: String,
    pub status: FixStatus,
    pub applied_fix: FixAction,
    pub start_time: String,
    pub end_time: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub rollback_applied: bool,
    pub verification_result: Option<VerificationResult>,
}
