pub mod actuator;
pub mod approval;
pub mod catalog;
pub mod classifier;
pub mod config;
pub mod diagnoser;
pub mod event_log;
pub mod executor;
pub mod llm;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod selector;
pub mod store;

pub use config::HealerConfig;
pub use model::FailureEvent;
pub use orchestrator::{RemediationLoop, RemediationOutcome};
