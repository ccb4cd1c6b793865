//! Deterministic root-cause classification of failure text.
//!
//! Rules are checked in a fixed order and the first match wins; several
//! keywords overlap (a schema error usually also says "missing"), so the
//! order is part of the contract.

use crate::model::{Confidence, Diagnosis, FailureEvent, RemediationSafety};
use once_cell::sync::Lazy;
use regex::Regex;

static MISSING_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)missing required field '([^']+)'").expect("missing-field pattern")
});

static TYPE_MISMATCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'([^']+)' must be ([^,;]+)").expect("type pattern"));

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailurePattern {
    SchemaValidation { missing_fields: Vec<String> },
    Connectivity { timeout: bool },
    DataType { field: Option<(String, String)> },
    MissingField,
    Unknown,
}

pub fn detect_pattern(error_message: &str) -> FailurePattern {
    let lower = error_message.to_lowercase();

    if lower.contains("schema") || lower.contains("validation") {
        FailurePattern::SchemaValidation {
            missing_fields: missing_fields(error_message),
        }
    } else if lower.contains("connection") || lower.contains("timeout") {
        FailurePattern::Connectivity {
            timeout: lower.contains("timeout"),
        }
    } else if lower.contains("type") || lower.contains("integer") || lower.contains("string") {
        FailurePattern::DataType {
            field: TYPE_MISMATCH.captures(error_message).map(|caps| {
                (caps[1].to_string(), caps[2].trim().to_string())
            }),
        }
    } else if lower.contains("missing") || lower.contains("required") {
        FailurePattern::MissingField
    } else {
        FailurePattern::Unknown
    }
}

/// Every `missing required field '<name>'` occurrence, deduplicated, in order.
pub fn missing_fields(error_message: &str) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    for caps in MISSING_FIELD.captures_iter(error_message) {
        let field = caps[1].to_string();
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
    fields
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PatternClassifier;

impl PatternClassifier {
    /// Total: unrecognized text yields a low-confidence, review-required result.
    pub fn classify(&self, event: &FailureEvent) -> Diagnosis {
        let message = event.error_message.as_str();
        match detect_pattern(message) {
            FailurePattern::SchemaValidation { missing_fields } if !missing_fields.is_empty() => {
                let joined = missing_fields.join(", ");
                diagnosis(
                    format!("Schema mismatch: missing required fields: {joined}"),
                    Confidence::High,
                    vec![
                        format!("Add missing field(s): {joined}"),
                        "Update schema definition to match actual data".into(),
                        "Use data transformation to add default values".into(),
                    ],
                    RemediationSafety::Safe,
                    format!("Schema validation error detected: {message}"),
                    false,
                )
            }
            FailurePattern::SchemaValidation { .. } => diagnosis(
                "Schema validation failed - unknown field mismatch".into(),
                Confidence::High,
                vec![
                    "Review and update schema definition".into(),
                    "Check data source for unexpected fields".into(),
                    "Implement schema evolution handling".into(),
                ],
                RemediationSafety::Safe,
                format!("Schema validation error detected: {message}"),
                false,
            ),
            FailurePattern::Connectivity { timeout: true } => diagnosis(
                "API timeout - service may be overloaded or network issues".into(),
                Confidence::Medium,
                vec![
                    "Increase timeout settings".into(),
                    "Implement retry logic with exponential backoff".into(),
                    "Check API service health".into(),
                ],
                RemediationSafety::Risky,
                format!("Connection error detected: {message}"),
                true,
            ),
            FailurePattern::Connectivity { timeout: false } => diagnosis(
                "Connection failure - service unavailable or network issues".into(),
                Confidence::Medium,
                vec![
                    "Check API endpoint availability".into(),
                    "Verify network connectivity".into(),
                    "Implement circuit breaker pattern".into(),
                ],
                RemediationSafety::Risky,
                format!("Connection error detected: {message}"),
                true,
            ),
            FailurePattern::DataType {
                field: Some((field, expected)),
            } => diagnosis(
                format!("Data type mismatch: field '{field}' should be {expected}"),
                Confidence::High,
                vec![
                    format!("Add data type conversion for field '{field}'"),
                    "Update data source to provide correct data types".into(),
                    "Implement data validation and transformation".into(),
                ],
                RemediationSafety::Safe,
                format!("Data type error detected: {message}"),
                false,
            ),
            FailurePattern::DataType { field: None } => diagnosis(
                "Data type validation failed".into(),
                Confidence::High,
                vec![
                    "Review data type definitions".into(),
                    "Implement data type conversion logic".into(),
                    "Add data validation checks".into(),
                ],
                RemediationSafety::Safe,
                format!("Data type error detected: {message}"),
                false,
            ),
            FailurePattern::MissingField => diagnosis(
                "Required field missing from data source".into(),
                Confidence::High,
                vec![
                    "Add missing field to data source".into(),
                    "Provide default value for missing field".into(),
                    "Update pipeline to handle optional fields".into(),
                ],
                RemediationSafety::Safe,
                format!("Missing field error detected: {message}"),
                false,
            ),
            FailurePattern::Unknown => diagnosis(
                "Unknown error pattern".into(),
                Confidence::Low,
                vec![
                    "Review logs manually".into(),
                    "Check system resources".into(),
                ],
                RemediationSafety::Risky,
                format!("Unable to identify specific pattern in error: {message}"),
                true,
            ),
        }
    }
}

fn diagnosis(
    root_cause: String,
    confidence: Confidence,
    suggested_fixes: Vec<String>,
    remediation_safety: RemediationSafety,
    reasoning: String,
    requires_human_review: bool,
) -> Diagnosis {
    Diagnosis {
        root_cause,
        confidence,
        suggested_fixes,
        remediation_safety,
        reasoning,
        requires_human_review,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}
