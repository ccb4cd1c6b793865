//! Canonical wire schema for pipeline failure notifications.
//!
//! Every transport adapter normalizes its payload into a [`CanonicalFailureV1`]
//! and runs [`validate_failure_v1`] before the event reaches the remediation
//! loop. Anything that fails here is rejected at intake.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCHEMA_V1: &str = "failure.v1";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CanonicalFailureV1 {
    pub schema: String,
    pub dag_id: String,
    pub task_id: String,
    pub execution_date: String,
    pub error_message: String,
    pub error_type: String,
    pub timestamp: String,
    pub retry_count: i64,
    pub source: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntakeError {
    #[error("unsupported schema '{0}'")]
    UnsupportedSchema(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("retry_count must be >= 0, got {0}")]
    NegativeRetryCount(i64),
    #[error("unparseable timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

pub fn validate_failure_v1(failure: &CanonicalFailureV1) -> Result<(), IntakeError> {
    if failure.schema != SCHEMA_V1 {
        return Err(IntakeError::UnsupportedSchema(failure.schema.clone()));
    }
    if failure.dag_id.trim().is_empty() {
        return Err(IntakeError::MissingField("dag_id"));
    }
    if failure.task_id.trim().is_empty() {
        return Err(IntakeError::MissingField("task_id"));
    }
    if failure.retry_count < 0 {
        return Err(IntakeError::NegativeRetryCount(failure.retry_count));
    }
    if parse_timestamp(&failure.timestamp).is_none() {
        return Err(IntakeError::InvalidTimestamp(failure.timestamp.clone()));
    }
    Ok(())
}

/// Parses RFC 3339 timestamps, falling back to naive ISO-8601 (read as UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical() -> CanonicalFailureV1 {
        CanonicalFailureV1 {
            schema: SCHEMA_V1.into(),
            dag_id: "self_healing_pipeline".into(),
            task_id: "validate_schema".into(),
            execution_date: "2024-01-01T00:00:00".into(),
            error_message: "Schema validation failed".into(),
            error_type: "schema_validation".into(),
            timestamp: "2024-01-01T00:00:05.123456".into(),
            retry_count: 0,
            source: "generic".into(),
        }
    }

    #[test]
    fn validates_failure_v1() {
        assert!(validate_failure_v1(&canonical()).is_ok());
    }

    #[test]
    fn rejects_blank_task_id() {
        let mut failure = canonical();
        failure.task_id = "  ".into();
        assert_eq!(
            validate_failure_v1(&failure),
            Err(IntakeError::MissingField("task_id"))
        );
    }

    #[test]
    fn rejects_negative_retry_count_and_bad_timestamp() {
        let mut failure = canonical();
        failure.retry_count = -1;
        assert_eq!(
            validate_failure_v1(&failure),
            Err(IntakeError::NegativeRetryCount(-1))
        );

        let mut failure = canonical();
        failure.timestamp = "yesterday".into();
        assert!(matches!(
            validate_failure_v1(&failure),
            Err(IntakeError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn parses_rfc3339_and_naive_timestamps() {
        let offset = parse_timestamp("2024-01-01T02:00:00+02:00").expect("rfc3339");
        let naive = parse_timestamp("2024-01-01T00:00:00").expect("naive");
        assert_eq!(offset, naive);
        assert!(parse_timestamp("2024-01-01 00:00:00.5").is_some());
        assert!(parse_timestamp("not a time").is_none());
    }
}
