use crate::llm::LlmConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub time_window: chrono::Duration,
    pub consecutive_failures: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            time_window: chrono::Duration::hours(24),
            consecutive_failures: 3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub actuator_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            actuator_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalStoreKind {
    File(PathBuf),
    Sqlite(PathBuf),
    Memory,
}

impl ApprovalStoreKind {
    /// `file:<path>`, `sqlite:<path>` or `memory`. A bare path means a file.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("memory") {
            return ApprovalStoreKind::Memory;
        }
        if let Some(path) = value.strip_prefix("sqlite:") {
            return ApprovalStoreKind::Sqlite(PathBuf::from(path));
        }
        let path = value.strip_prefix("file:").unwrap_or(value);
        ApprovalStoreKind::File(PathBuf::from(path))
    }
}

#[derive(Clone, Debug)]
pub struct HealerConfig {
    pub actuator_base_url: String,
    pub simulate_actuators: bool,
    pub monitor: MonitorConfig,
    pub executor: ExecutorConfig,
    pub approval_store: ApprovalStoreKind,
    pub records_path: PathBuf,
    pub event_log_path: Option<String>,
    pub llm: Option<LlmConfig>,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            actuator_base_url: "http://localhost:5000".into(),
            simulate_actuators: false,
            monitor: MonitorConfig::default(),
            executor: ExecutorConfig::default(),
            approval_store: ApprovalStoreKind::File(PathBuf::from("data/approval_state.json")),
            records_path: PathBuf::from("data/records.json"),
            event_log_path: Some("data/healer.db".into()),
            llm: None,
        }
    }
}

impl HealerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            actuator_base_url: std::env::var("HEALER_ACTUATOR_URL")
                .unwrap_or(defaults.actuator_base_url),
            simulate_actuators: std::env::var("HEALER_SIMULATE_ACTUATORS")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            monitor: MonitorConfig {
                time_window: env_parse::<i64>("HEALER_TIME_WINDOW_HOURS")
                    .and_then(window_hours)
                    .unwrap_or(defaults.monitor.time_window),
                consecutive_failures: env_parse("HEALER_CONSECUTIVE_FAILURES")
                    .unwrap_or(defaults.monitor.consecutive_failures),
            },
            executor: ExecutorConfig {
                actuator_timeout: env_parse("HEALER_ACTUATOR_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.executor.actuator_timeout),
                settle_delay: env_parse("HEALER_SETTLE_DELAY_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.executor.settle_delay),
            },
            approval_store: std::env::var("HEALER_APPROVAL_STORE")
                .map(|v| ApprovalStoreKind::parse(&v))
                .unwrap_or(defaults.approval_store),
            records_path: std::env::var("HEALER_RECORDS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.records_path),
            event_log_path: match std::env::var("HEALER_EVENT_LOG") {
                Ok(v) if v.trim().is_empty() || v == "off" => None,
                Ok(v) => Some(v),
                Err(_) => defaults.event_log_path,
            },
            llm: build_llm_config_from_env(),
        }
    }
}

/// The model-backed classifier is only enabled when its API key is present.
pub fn build_llm_config_from_env() -> Option<LlmConfig> {
    let api_key_env = std::env::var("LLM_API_KEY_ENV").unwrap_or_else(|_| "OPENAI_API_KEY".into());
    if std::env::var(&api_key_env).is_err() {
        return None;
    }

    let defaults = LlmConfig::default();
    Some(LlmConfig {
        provider: std::env::var("LLM_PROVIDER").unwrap_or(defaults.provider),
        model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
        api_key_env,
        temperature: env_parse("LLM_TEMPERATURE").unwrap_or(defaults.temperature),
    })
}

/// `None` for non-positive or unrepresentable hour counts.
fn window_hours(hours: i64) -> Option<chrono::Duration> {
    if hours <= 0 {
        return None;
    }
    chrono::Duration::try_hours(hours)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HealerConfig::default();
        assert_eq!(config.monitor.time_window, chrono::Duration::hours(24));
        assert_eq!(config.monitor.consecutive_failures, 3);
        assert_eq!(config.executor.actuator_timeout, Duration::from_secs(30));
        assert_eq!(config.executor.settle_delay, Duration::from_secs(5));
    }

    #[test]
    fn out_of_range_window_falls_back() {
        assert_eq!(window_hours(48), Some(chrono::Duration::hours(48)));
        assert_eq!(window_hours(0), None);
        assert_eq!(window_hours(-5), None);
        assert_eq!(window_hours(10_000_000_000_000_000), None);
        assert_eq!(window_hours(i64::MAX), None);
    }

    #[test]
    fn parses_approval_store_kinds() {
        assert_eq!(ApprovalStoreKind::parse("memory"), ApprovalStoreKind::Memory);
        assert_eq!(
            ApprovalStoreKind::parse("sqlite:/tmp/a.db"),
            ApprovalStoreKind::Sqlite(PathBuf::from("/tmp/a.db"))
        );
        assert_eq!(
            ApprovalStoreKind::parse("file:state.json"),
            ApprovalStoreKind::File(PathBuf::from("state.json"))
        );
        assert_eq!(
            ApprovalStoreKind::parse("state.json"),
            ApprovalStoreKind::File(PathBuf::from("state.json"))
        );
    }
}
