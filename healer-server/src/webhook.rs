use failure_registry::{
    now_timestamp, validate_failure_v1, CanonicalFailureV1, IntakeError, SCHEMA_V1,
};
use healer_core::FailureEvent;
use serde_json::Value;

/// Normalizes one transport's payload into the canonical failure schema.
pub trait FailureAdapter: Send + Sync + 'static {
    fn parse(&self, payload: &Value) -> Result<CanonicalFailureV1, IntakeError>;
}

/// Flat failure documents, keys in snake_case or camelCase.
pub struct PipelineAdapter;

/// Task-instance callback context as posted by an Airflow failure callback.
pub struct AirflowContextAdapter;

impl FailureAdapter for PipelineAdapter {
    fn parse(&self, payload: &Value) -> Result<CanonicalFailureV1, IntakeError> {
        if !payload.is_object() {
            return Err(IntakeError::Malformed("expected a json object".into()));
        }
        let failure = CanonicalFailureV1 {
            schema: SCHEMA_V1.into(),
            dag_id: text(payload, &["dag_id", "dagId"]).unwrap_or_default(),
            task_id: text(payload, &["task_id", "taskId"]).unwrap_or_default(),
            execution_date: text(payload, &["execution_date", "executionDate"]).unwrap_or_default(),
            error_message: text(payload, &["error_message", "errorMessage", "error"])
                .unwrap_or_default(),
            error_type: text(payload, &["error_type", "errorType"])
                .unwrap_or_else(|| "unknown".into()),
            timestamp: text(payload, &["timestamp"]).unwrap_or_else(now_timestamp),
            retry_count: integer(payload, &["retry_count", "retryCount"])?.unwrap_or(0),
            source: "pipeline".into(),
        };
        validate_failure_v1(&failure)?;
        Ok(failure)
    }
}

impl FailureAdapter for AirflowContextAdapter {
    fn parse(&self, payload: &Value) -> Result<CanonicalFailureV1, IntakeError> {
        let task_instance = payload
            .get("task_instance")
            .filter(|ti| ti.is_object())
            .ok_or_else(|| IntakeError::Malformed("airflow payload missing task_instance".into()))?;

        let dag_id = payload
            .get("dag")
            .and_then(|dag| text(dag, &["dag_id"]))
            .or_else(|| text(task_instance, &["dag_id"]))
            .unwrap_or_default();
        let task_id = text(task_instance, &["task_id"]).unwrap_or_default();
        let error_message = text(payload, &["exception", "reason", "error_message"])
            .unwrap_or_else(|| format!("Task {task_id} failed"));
        // Airflow counts attempts from 1.
        let retry_count = integer(task_instance, &["try_number"])?
            .map(|attempt| (attempt - 1).max(0))
            .unwrap_or(0);

        let failure = CanonicalFailureV1 {
            schema: SCHEMA_V1.into(),
            dag_id,
            task_id,
            execution_date: text(payload, &["execution_date", "logical_date"])
                .or_else(|| text(task_instance, &["execution_date"]))
                .unwrap_or_default(),
            error_message,
            error_type: text(payload, &["error_type"]).unwrap_or_else(|| "unknown".into()),
            timestamp: now_timestamp(),
            retry_count,
            source: "airflow".into(),
        };
        validate_failure_v1(&failure)?;
        Ok(failure)
    }
}

pub fn parse_with_adapter(
    payload: &Value,
    adapter: &dyn FailureAdapter,
) -> Result<FailureEvent, IntakeError> {
    let canonical = adapter.parse(payload)?;
    Ok(FailureEvent {
        dag_id: canonical.dag_id,
        task_id: canonical.task_id,
        execution_date: canonical.execution_date,
        error_message: canonical.error_message,
        error_type: canonical.error_type,
        timestamp: canonical.timestamp,
        retry_count: u32::try_from(canonical.retry_count).unwrap_or(u32::MAX),
        resolved: false,
    })
}

fn text(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find_map(Value::as_str)
        .map(ToString::to_string)
}

fn integer(payload: &Value, keys: &[&str]) -> Result<Option<i64>, IntakeError> {
    let Some((key, value)) = keys
        .iter()
        .find_map(|key| payload.get(*key).map(|value| (*key, value)))
    else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| IntakeError::Malformed(format!("{key} must be an integer"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IntakeError::Malformed(format!("{key} must be an integer"))),
        _ => Err(IntakeError::Malformed(format!("{key} must be an integer"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_payload_accepts_both_key_styles() {
        let snake = parse_with_adapter(
            &json!({
                "dag_id": "self_healing_pipeline",
                "task_id": "validate_schema",
                "execution_date": "2024-01-01T00:00:00",
                "error_message": "Missing required field 'email'",
                "error_type": "schema_validation",
                "timestamp": "2024-01-01T00:05:00",
                "retry_count": 1
            }),
            &PipelineAdapter,
        )
        .expect("snake");
        let camel = parse_with_adapter(
            &json!({
                "dagId": "self_healing_pipeline",
                "taskId": "validate_schema",
                "executionDate": "2024-01-01T00:00:00",
                "errorMessage": "Missing required field 'email'",
                "errorType": "schema_validation",
                "timestamp": "2024-01-01T00:05:00",
                "retryCount": "1"
            }),
            &PipelineAdapter,
        )
        .expect("camel");
        assert_eq!(snake, camel);
        assert_eq!(snake.retry_count, 1);
        assert!(!snake.resolved);
    }

    #[test]
    fn flat_payload_defaults_type_and_timestamp() {
        let event = parse_with_adapter(
            &json!({"dag_id": "etl", "task_id": "load", "error_message": "boom"}),
            &PipelineAdapter,
        )
        .expect("event");
        assert_eq!(event.error_type, "unknown");
        assert_eq!(event.retry_count, 0);
        assert!(failure_registry::parse_timestamp(&event.timestamp).is_some());
    }

    #[test]
    fn flat_payload_rejects_malformed_input() {
        assert_eq!(
            parse_with_adapter(&json!({"task_id": "load"}), &PipelineAdapter),
            Err(IntakeError::MissingField("dag_id"))
        );
        assert_eq!(
            parse_with_adapter(
                &json!({"dag_id": "etl", "task_id": "load", "retry_count": -2}),
                &PipelineAdapter
            ),
            Err(IntakeError::NegativeRetryCount(-2))
        );
        assert!(matches!(
            parse_with_adapter(
                &json!({"dag_id": "etl", "task_id": "load", "retry_count": [1]}),
                &PipelineAdapter
            ),
            Err(IntakeError::Malformed(_))
        ));
        assert!(matches!(
            parse_with_adapter(&json!(["not", "an", "object"]), &PipelineAdapter),
            Err(IntakeError::Malformed(_))
        ));
    }

    #[test]
    fn airflow_context_maps_attempts_to_retries() {
        let event = parse_with_adapter(
            &json!({
                "dag": {"dag_id": "self_healing_pipeline"},
                "task_instance": {"task_id": "fetch_api_data", "try_number": 3},
                "execution_date": "2024-01-01T00:00:00+00:00",
                "exception": "Connection timeout while calling /api/employees",
                "error_type": "connection_error"
            }),
            &AirflowContextAdapter,
        )
        .expect("event");
        assert_eq!(event.dag_id, "self_healing_pipeline");
        assert_eq!(event.task_id, "fetch_api_data");
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.error_type, "connection_error");
    }

    #[test]
    fn airflow_context_without_exception_names_the_task() {
        let event = parse_with_adapter(
            &json!({
                "dag": {"dag_id": "self_healing_pipeline"},
                "task_instance": {"task_id": "load_data"}
            }),
            &AirflowContextAdapter,
        )
        .expect("event");
        assert_eq!(event.error_message, "Task load_data failed");
        assert_eq!(event.error_type, "unknown");

        assert!(matches!(
            parse_with_adapter(&json!({"dag": {}}), &AirflowContextAdapter),
            Err(IntakeError::Malformed(_))
        ));
    }
}
