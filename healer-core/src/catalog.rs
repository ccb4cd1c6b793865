use crate::model::{FailureEvent, FixAction, FixType, SafetyLevel};
use serde_json::{json, Map, Value};

/// Error category the catalog is keyed by, read from `FailureEvent::error_type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    SchemaValidation,
    ConnectionError,
    DataTypeError,
    MissingField,
    Unrecognized(String),
}

impl ErrorCategory {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "schema_validation" => ErrorCategory::SchemaValidation,
            "connection_error" => ErrorCategory::ConnectionError,
            "data_type_error" => ErrorCategory::DataTypeError,
            "missing_field" => ErrorCategory::MissingField,
            other => ErrorCategory::Unrecognized(other.to_string()),
        }
    }
}

/// Ordered remediation strategies for a category; empty when unrecognized.
pub fn strategies_for(category: &ErrorCategory, event: &FailureEvent) -> Vec<FixAction> {
    match category {
        ErrorCategory::SchemaValidation => vec![
            action(
                FixType::SchemaUpdate,
                "Update schema definition to match actual data structure",
                json!({
                    "action": "update_schema",
                    "dag_id": event.dag_id,
                    "task_id": event.task_id,
                }),
                SafetyLevel::Safe,
                60,
                "Restore original schema definition",
            ),
            action(
                FixType::DataTransformation,
                "Add data transformation to handle schema mismatches",
                json!({
                    "action": "add_transformation",
                    "transform_type": "schema_adaptation",
                }),
                SafetyLevel::Safe,
                120,
                "Remove added transformation step",
            ),
        ],
        ErrorCategory::ConnectionError => vec![
            action(
                FixType::RetryTask,
                "Retry failed task with exponential backoff",
                json!({
                    "action": "retry_task",
                    "dag_id": event.dag_id,
                    "task_id": event.task_id,
                    "max_retries": 3,
                    "backoff_factor": 2,
                }),
                SafetyLevel::Safe,
                300,
                "Stop retry attempts",
            ),
            action(
                FixType::ConfigUpdate,
                "Increase timeout settings for API calls",
                json!({
                    "action": "update_timeout",
                    "timeout_seconds": 60,
                }),
                SafetyLevel::Risky,
                30,
                "Restore original timeout settings",
            ),
        ],
        ErrorCategory::DataTypeError => vec![action(
            FixType::DataTransformation,
            "Add data type conversion logic",
            json!({
                "action": "add_type_conversion",
                "transform_type": "type_conversion",
                "conversion_rules": "auto_detect",
            }),
            SafetyLevel::Safe,
            90,
            "Remove type conversion logic",
        )],
        ErrorCategory::MissingField => vec![action(
            FixType::DataTransformation,
            "Add default values for missing fields",
            json!({
                "action": "add_default_values",
                "transform_type": "default_values",
                "default_strategy": "null_safe",
            }),
            SafetyLevel::Safe,
            60,
            "Remove default value logic",
        )],
        ErrorCategory::Unrecognized(_) => Vec::new(),
    }
}

pub fn manual_intervention() -> FixAction {
    action(
        FixType::ManualIntervention,
        "Manual intervention required - automated remediation cannot safely apply a fix",
        json!({
            "action": "notify_human",
            "priority": "high",
        }),
        SafetyLevel::Unsafe,
        0,
        "Manual intervention required",
    )
}

fn action(
    fix_type: FixType,
    description: &str,
    parameters: Value,
    safety_level: SafetyLevel,
    estimated_duration_seconds: u64,
    rollback_plan: &str,
) -> FixAction {
    let parameters = match parameters {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    FixAction {
        fix_type,
        description: description.into(),
        parameters,
        safety_level,
        estimated_duration_seconds,
        rollback_plan: rollback_plan.into(),
    }
}
