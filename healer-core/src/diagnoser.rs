use crate::classifier::PatternClassifier;
use crate::llm::{ModelClassifier, ModelVerdict};
use crate::model::{Diagnosis, FailureEvent};
use failure_registry::parse_timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

pub enum DiagnosisEngine {
    Pattern(PatternClassifier),
    ModelBacked(ModelClassifier),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosisSource {
    Model,
    Pattern,
    PatternFallback { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisSummary {
    pub total_diagnoses: usize,
    pub confidence_distribution: BTreeMap<String, usize>,
    pub safety_distribution: BTreeMap<String, usize>,
    pub timestamp: String,
}

pub struct Diagnoser {
    engine: DiagnosisEngine,
    history: Mutex<Vec<Diagnosis>>,
}

impl Diagnoser {
    pub fn new(engine: DiagnosisEngine) -> Self {
        Self {
            engine,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn pattern() -> Self {
        Self::new(DiagnosisEngine::Pattern(PatternClassifier))
    }

    /// Never fails and never drops a result; low confidence is signalled by
    /// `requires_human_review`.
    pub async fn diagnose(
        &self,
        event: &FailureEvent,
        history: &[FailureEvent],
    ) -> (Diagnosis, DiagnosisSource) {
        let (diagnosis, source) = match &self.engine {
            DiagnosisEngine::Pattern(classifier) => {
                (classifier.classify(event), DiagnosisSource::Pattern)
            }
            DiagnosisEngine::ModelBacked(model) => {
                resolve_verdict(model.request(event, history).await, event)
            }
        };

        info!(
            task_id = %event.task_id,
            root_cause = %diagnosis.root_cause,
            confidence = diagnosis.confidence.as_str(),
            safety = diagnosis.remediation_safety.as_str(),
            ?source,
            "diagnosis produced"
        );
        self.history.lock().push(diagnosis.clone());
        (diagnosis, source)
    }

    pub fn history(&self) -> Vec<Diagnosis> {
        self.history.lock().clone()
    }

    pub fn diagnosis_summary(&self) -> DiagnosisSummary {
        let now = chrono::Utc::now();
        let cutoff = now - chrono::Duration::hours(24);
        let mut total = 0;
        let mut confidence = BTreeMap::new();
        let mut safety = BTreeMap::new();

        for diagnosis in self.history.lock().iter() {
            if !parse_timestamp(&diagnosis.timestamp).is_some_and(|ts| ts > cutoff) {
                continue;
            }
            total += 1;
            *confidence
                .entry(diagnosis.confidence.as_str().to_string())
                .or_insert(0) += 1;
            *safety
                .entry(diagnosis.remediation_safety.as_str().to_string())
                .or_insert(0) += 1;
        }

        DiagnosisSummary {
            total_diagnoses: total,
            confidence_distribution: confidence,
            safety_distribution: safety,
            timestamp: now.to_rfc3339(),
        }
    }
}

/// Model answer first; any parse failure or error falls back to the
/// deterministic rules.
pub fn resolve_verdict(verdict: ModelVerdict, event: &FailureEvent) -> (Diagnosis, DiagnosisSource) {
    match verdict {
        ModelVerdict::Parsed(diagnosis) => (diagnosis, DiagnosisSource::Model),
        ModelVerdict::Unparseable(reason) | ModelVerdict::Failed(reason) => (
            PatternClassifier.classify(event),
            DiagnosisSource::PatternFallback { reason },
        ),
    }
}
