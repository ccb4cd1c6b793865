use crate::catalog::{self, ErrorCategory};
use crate::model::{Diagnosis, FailureEvent, FixAction, RemediationSafety, SafetyLevel};

/// First strategy that is safe on its own, or the first strategy outright
/// once the diagnosis has declared the remediation safe. Falls back to
/// manual intervention.
pub fn select_fix(diagnosis: &Diagnosis, event: &FailureEvent) -> FixAction {
    let category = ErrorCategory::from_tag(&event.error_type);
    let diagnosis_safe = diagnosis.remediation_safety == RemediationSafety::Safe;

    catalog::strategies_for(&category, event)
        .into_iter()
        .find(|strategy| strategy.safety_level == SafetyLevel::Safe || diagnosis_safe)
        .unwrap_or_else(catalog::manual_intervention)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Confidence, FixType};

    fn event(error_type: &str) -> FailureEvent {
        FailureEvent {
            dag_id: "etl".into(),
            task_id: "extract".into(),
            execution_date: String::new(),
            error_message: String::new(),
            error_type: error_type.into(),
            timestamp: String::new(),
            retry_count: 0,
            resolved: false,
        }
    }

    fn diagnosis(safety: RemediationSafety) -> Diagnosis {
        Diagnosis {
            root_cause: "x".into(),
            confidence: Confidence::High,
            suggested_fixes: vec![],
            remediation_safety: safety,
            reasoning: String::new(),
            requires_human_review: false,
            timestamp: String::new(),
        }
    }

    #[test]
    fn schema_validation_selects_schema_update_unless_unsafe() {
        for safety in [RemediationSafety::Safe, RemediationSafety::Risky] {
            let fix = select_fix(&diagnosis(safety), &event("schema_validation"));
            assert_eq!(fix.fix_type, FixType::SchemaUpdate);
        }
    }

    #[test]
    fn risky_diagnosis_still_takes_first_safe_strategy() {
        let fix = select_fix(&diagnosis(RemediationSafety::Risky), &event("connection_error"));
        assert_eq!(fix.fix_type, FixType::RetryTask);
    }

    #[test]
    fn category_comes_from_error_type_not_root_cause() {
        let fix = select_fix(&diagnosis(RemediationSafety::Safe), &event("data_type_error"));
        assert_eq!(fix.fix_type, FixType::DataTransformation);
        assert_eq!(fix.parameters.get("action"), Some(&serde_json::json!("add_type_conversion")));

        let fix = select_fix(&diagnosis(RemediationSafety::Safe), &event("missing_field"));
        assert_eq!(fix.parameters.get("action"), Some(&serde_json::json!("add_default_values")));
    }

    #[test]
    fn unrecognized_category_needs_a_human() {
        let fix = select_fix(&diagnosis(RemediationSafety::Safe), &event("unknown"));
        assert_eq!(fix.fix_type, FixType::ManualIntervention);
        assert_eq!(fix.safety_level, SafetyLevel::Unsafe);
        assert_eq!(fix.estimated_duration_seconds, 0);
    }
}
