use crate::model::{Confidence, Diagnosis, FailureEvent, RemediationSafety};
use rig::client::{completion::CompletionClient, ProviderClient};
use rig::completion::Prompt;
use rig::providers::openai;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.2,
        }
    }
}

/// Shape the model is asked to answer with.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct ModelDiagnosis {
    pub root_cause: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub suggested_fixes: Vec<String>,
    pub remediation_safety: RemediationSafety,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default = "review_by_default")]
    pub requires_human_review: bool,
}

fn review_by_default() -> bool {
    true
}

/// Outcome of one model-backed attempt. Only `Parsed` is used as-is; the
/// other two send the caller to the deterministic classifier.
#[derive(Clone, Debug)]
pub enum ModelVerdict {
    Parsed(Diagnosis),
    Unparseable(String),
    Failed(String),
}

pub struct ModelClassifier {
    config: LlmConfig,
    timeout: Duration,
}

impl ModelClassifier {
    pub fn new(config: LlmConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    pub async fn request(&self, event: &FailureEvent, history: &[FailureEvent]) -> ModelVerdict {
        let prompt = match diagnosis_prompt(event, history) {
            Ok(prompt) => prompt,
            Err(err) => return ModelVerdict::Failed(err),
        };

        let raw = match tokio::time::timeout(
            self.timeout,
            run_prompt(&self.config, "You are a pipeline failure diagnostician.", &prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(format!("llm prompt timed out after {:?}", self.timeout)),
        };
        interpret(raw)
    }
}

pub fn interpret(raw: Result<String, String>) -> ModelVerdict {
    match raw {
        Err(err) => {
            warn!(error = %err, "model-backed diagnosis failed");
            ModelVerdict::Failed(err)
        }
        Ok(raw) => match parse_model_diagnosis(&raw) {
            Ok(diagnosis) => {
                debug!(root_cause = %diagnosis.root_cause, "model diagnosis parsed");
                ModelVerdict::Parsed(diagnosis)
            }
            Err(err) => {
                warn!(error = %err, "model diagnosis could not be parsed");
                ModelVerdict::Unparseable(err)
            }
        },
    }
}

pub fn diagnosis_prompt(event: &FailureEvent, history: &[FailureEvent]) -> Result<String, String> {
    let schema = schemars::schema_for!(ModelDiagnosis);
    Ok(format!(
        "Analyze the following pipeline failure and return JSON only.\n\
         Schema: {}\n\
         Failure:\n\
         - DAG ID: {}\n\
         - Task ID: {}\n\
         - Error Type: {}\n\
         - Error Message: {}\n\
         - Execution Date: {}\n\
         - Retry Count: {}\n\
         Recent failure history:\n{}",
        serde_json::to_string(&schema).map_err(|e| e.to_string())?,
        event.dag_id,
        event.task_id,
        event.error_type,
        event.error_message,
        event.execution_date,
        event.retry_count,
        serde_json::to_string_pretty(history).map_err(|e| e.to_string())?,
    ))
}

async fn run_prompt(config: &LlmConfig, preamble: &str, prompt: &str) -> Result<String, String> {
    if config.provider.to_lowercase() != "openai" {
        return Err(format!("unsupported llm provider '{}'", config.provider));
    }

    let client = if config.api_key_env == "OPENAI_API_KEY" {
        openai::Client::from_env()
    } else {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| format!("missing env var {}", config.api_key_env))?;
        openai::Client::new(&api_key).map_err(|e| format!("openai client error: {e}"))?
    };

    let agent = client
        .agent(&config.model)
        .preamble(preamble)
        .temperature(config.temperature)
        .build();

    agent
        .prompt(prompt)
        .await
        .map_err(|e| format!("llm prompt failed: {e}"))
}

/// Reads the outermost `{...}` of the answer into a [`Diagnosis`].
pub fn parse_model_diagnosis(raw: &str) -> Result<Diagnosis, String> {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Err("no json object in llm answer".into());
    };
    if end < start {
        return Err("no json object in llm answer".into());
    }
    let parsed: ModelDiagnosis = serde_json::from_str(&raw[start..=end])
        .map_err(|e| format!("invalid llm diagnosis json: {e}"))?;
    if parsed.root_cause.trim().is_empty() {
        return Err("llm diagnosis has an empty root_cause".into());
    }

    Ok(Diagnosis {
        root_cause: parsed.root_cause,
        confidence: parsed.confidence,
        suggested_fixes: parsed.suggested_fixes,
        remediation_safety: parsed.remediation_safety,
        reasoning: parsed.reasoning.unwrap_or_else(|| raw.to_string()),
        requires_human_review: parsed.requires_human_review,
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_wrapped_in_prose() {
        let raw = r#"Here is my analysis:
        {"root_cause":"email column dropped upstream","confidence":"high",
         "suggested_fixes":["Add missing field(s): email"],
         "remediation_safety":"safe","reasoning":"schema diff","requires_human_review":false}
        Let me know if you need more."#;
        let d = parse_model_diagnosis(raw).expect("parse");
        assert_eq!(d.root_cause, "email column dropped upstream");
        assert_eq!(d.confidence, Confidence::High);
        assert_eq!(d.remediation_safety, RemediationSafety::Safe);
        assert!(!d.requires_human_review);
    }

    #[test]
    fn missing_optional_fields_take_cautious_defaults() {
        let raw = r#"{"root_cause":"upstream outage","confidence":"medium","remediation_safety":"risky"}"#;
        let d = parse_model_diagnosis(raw).expect("parse");
        assert!(d.suggested_fixes.is_empty());
        assert!(d.requires_human_review);
        assert_eq!(d.reasoning, raw);
    }

    #[test]
    fn rejects_answers_outside_the_shape() {
        assert!(parse_model_diagnosis("no idea").is_err());
        assert!(parse_model_diagnosis(r#"{"root_cause":"x","confidence":"certain","remediation_safety":"safe"}"#).is_err());
        assert!(parse_model_diagnosis(r#"{"confidence":"high","remediation_safety":"safe"}"#).is_err());
    }

    #[test]
    fn interpret_tags_each_failure_mode() {
        assert!(matches!(
            interpret(Err("llm prompt failed: 500".into())),
            ModelVerdict::Failed(_)
        ));
        assert!(matches!(
            interpret(Ok("not json".into())),
            ModelVerdict::Unparseable(_)
        ));
        assert!(matches!(
            interpret(Ok(r#"{"root_cause":"x","confidence":"low","remediation_safety":"unsafe"}"#.into())),
            ModelVerdict::Parsed(_)
        ));
    }

    #[test]
    fn prompt_embeds_schema_and_history() {
        let event = FailureEvent {
            dag_id: "etl".into(),
            task_id: "validate".into(),
            execution_date: "2024-01-01".into(),
            error_message: "Schema validation failed".into(),
            error_type: "schema_validation".into(),
            timestamp: "2024-01-01T00:00:00".into(),
            retry_count: 1,
            resolved: false,
        };
        let prompt = diagnosis_prompt(&event, std::slice::from_ref(&event)).expect("prompt");
        assert!(prompt.contains("remediation_safety"));
        assert!(prompt.contains("Task ID: validate"));
        assert!(prompt.contains("\"error_type\": \"schema_validation\""));
    }
}
