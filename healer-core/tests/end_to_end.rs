use healer_core::actuator::HttpActuator;
use healer_core::approval::{ApprovalGate, RecordPatcher};
use healer_core::config::{ExecutorConfig, MonitorConfig};
use healer_core::diagnoser::{Diagnoser, DiagnosisSource};
use healer_core::executor::Executor;
use healer_core::model::{Confidence, FixStatus, FixType, RemediationSafety};
use healer_core::monitor::{InterventionReason, SeverityMonitor};
use healer_core::store::MemoryStore;
use healer_core::{FailureEvent, RemediationLoop};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn schema_failure() -> FailureEvent {
    FailureEvent {
        dag_id: "self_healing_pipeline".into(),
        task_id: "validate_schema".into(),
        execution_date: "2024-01-01T00:00:00".into(),
        error_message: "Schema validation failed: Record 0: Missing required field 'email'".into(),
        error_type: "schema_validation".into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        retry_count: 0,
        resolved: false,
    }
}

fn healer_against(server: &MockServer) -> RemediationLoop<HttpActuator> {
    let actuator = HttpActuator::new(server.uri(), Duration::from_secs(5)).expect("client");
    let executor = Executor::new(
        Arc::new(actuator),
        ExecutorConfig {
            actuator_timeout: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
        },
        Arc::new(ApprovalGate::new(Arc::new(MemoryStore::new()))),
        Arc::new(RecordPatcher::new("/tmp/pipeline-healer-tests/unused-records.json")),
    );
    RemediationLoop::new(
        SeverityMonitor::new(MonitorConfig::default()),
        Diagnoser::pattern(),
        executor,
    )
}

async fn mount_ok(server: &MockServer, endpoint: &str, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn schema_failure_is_remediated_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/update_schema"))
        .and(body_partial_json(json!({
            "dag_id": "self_healing_pipeline",
            "task_id": "validate_schema",
            "action": "update_schema",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "schema updated"})))
        .expect(1)
        .mount(&server)
        .await;
    mount_ok(&server, "/api/verify_fix", json!({"status": "verified"})).await;

    let healer = healer_against(&server);
    let outcome = healer.handle(schema_failure()).await;

    assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);

    let monitor = outcome.monitor.expect("monitor");
    assert!(monitor.should_intervene);
    assert_eq!(monitor.reason, Some(InterventionReason::SchemaValidation));

    let diagnosis = outcome.diagnosis.expect("diagnosis");
    assert!(diagnosis.root_cause.contains("email"));
    assert_eq!(diagnosis.confidence, Confidence::High);
    assert_eq!(diagnosis.remediation_safety, RemediationSafety::Safe);
    assert_eq!(outcome.diagnosis_source, Some(DiagnosisSource::Pattern));

    let fix = outcome.fix.expect("fix");
    assert_eq!(fix.applied_fix.fix_type, FixType::SchemaUpdate);
    assert_eq!(fix.status, FixStatus::Success);
    let verification = fix.verification_result.expect("verification");
    assert!(verification.verified);
    assert_eq!(verification.details, Some(json!({"status": "verified"})));
}

#[tokio::test]
async fn successful_fix_can_be_rolled_back() {
    let server = MockServer::start().await;
    mount_ok(&server, "/api/update_schema", json!({"status": "schema updated"})).await;
    mount_ok(&server, "/api/verify_fix", json!({"status": "verified"})).await;
    Mock::given(method("POST"))
        .and(path("/api/rollback"))
        .and(body_partial_json(json!({
            "fix_type": "schema_update",
            "rollback_plan": "Restore original schema definition",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "rolled back"})))
        .mount(&server)
        .await;

    let healer = healer_against(&server);
    let fix_id = healer.handle(schema_failure()).await.fix.expect("fix").fix_id;

    assert!(healer.rollback(&fix_id).await);
    let fix = healer.executor().find(&fix_id).expect("fix");
    assert_eq!(fix.status, FixStatus::RolledBack);
    assert!(fix.rollback_applied);

    let before = healer.executor().history();
    assert!(!healer.rollback("fix_0_0_unknown").await);
    assert_eq!(healer.executor().history(), before);
}

#[tokio::test]
async fn unreachable_actuator_yields_failed_fix_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/update_schema"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let healer = healer_against(&server);
    let outcome = healer.handle(schema_failure()).await;

    assert!(outcome.errors.is_empty());
    let fix = outcome.fix.expect("fix");
    assert_eq!(fix.status, FixStatus::Failed);
    assert!(fix.error_message.expect("message").contains("502"));
    assert!(fix.verification_result.is_none());
}
