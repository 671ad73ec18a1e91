//! # Orchestrator Configuration
//!
//! ## Responsibility
//! Describe every tunable of the orchestrator as a typed, TOML-deserialisable
//! value with documented defaults, and export it as JSON Schema.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Complete defaults: an empty file is a valid configuration
//! - Validated: semantic constraints are checked by [`validation::validate`]
//!   before [`loader`] hands a config out
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the orchestrator from config (that belongs to `orchestrator`)
//! - Reading the API key (that belongs to `gateway`)

pub mod loader;
pub mod validation;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::admission::ResourceCeilings;

// ── Default value functions ──────────────────────────────────────────────

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_admission_timeout_ms() -> u64 {
    1000
}

fn default_memory_ceiling_pct() -> f64 {
    80.0
}

fn default_cpu_ceiling_pct() -> f64 {
    80.0
}

fn default_disk_ceiling_pct() -> f64 {
    90.0
}

fn default_monitoring_interval_sec() -> u64 {
    30
}

fn default_cooldown_secs() -> u64 {
    5
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2000
}

fn default_api_key_env() -> String {
    "COMIC_API_KEY".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_request_timeout_sec() -> u64 {
    30
}

fn default_attempt_timeout_sec() -> u64 {
    10
}

fn default_max_topic_chars() -> usize {
    100
}

fn default_fallback_chars() -> usize {
    200
}

fn default_sentence_ceiling() -> usize {
    20
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// Every section and field has a documented default, so any subset may be
/// given.
///
/// # Example
///
/// ```toml
/// [admission]
/// max_concurrent_requests = 20
///
/// [upstream]
/// model = "gpt-4o"
/// max_retries = 2
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrency gate.
    pub admission: AdmissionConfig,
    /// Health sampling and degradation thresholds.
    pub health: HealthConfig,
    /// Remote generation endpoint and retry policy.
    pub upstream: UpstreamConfig,
    /// Post-processing limits.
    pub generation: GenerationConfig,
    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Concurrency gate settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AdmissionConfig {
    /// Slot ceiling while healthy.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Longest wait for a free slot before `ResourceExhausted`.
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,
}

impl AdmissionConfig {
    /// `admission_timeout_ms` as a [`Duration`].
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            admission_timeout_ms: default_admission_timeout_ms(),
        }
    }
}

/// Health sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct HealthConfig {
    /// Memory usage (percent) above which the system degrades.
    #[serde(default = "default_memory_ceiling_pct")]
    pub memory_ceiling_pct: f64,
    /// CPU usage (percent) above which the system degrades.
    #[serde(default = "default_cpu_ceiling_pct")]
    pub cpu_ceiling_pct: f64,
    /// Disk usage (percent) above which the system degrades.
    #[serde(default = "default_disk_ceiling_pct")]
    pub disk_ceiling_pct: f64,
    /// Seconds between health samples.
    #[serde(default = "default_monitoring_interval_sec")]
    pub monitoring_interval_sec: u64,
    /// Advisory pause after entering `Degraded`.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Path whose filesystem is measured for disk usage. `None` means `/`.
    #[serde(default)]
    pub disk_path: Option<String>,
}

impl HealthConfig {
    /// Ceilings as used by the admission controller.
    pub fn ceilings(&self) -> ResourceCeilings {
        ResourceCeilings {
            memory_pct: self.memory_ceiling_pct,
            cpu_pct: self.cpu_ceiling_pct,
            disk_pct: self.disk_ceiling_pct,
        }
    }

    /// `monitoring_interval_sec` as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_sec)
    }

    /// `cooldown_secs` as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_pct: default_memory_ceiling_pct(),
            cpu_ceiling_pct: default_cpu_ceiling_pct(),
            disk_ceiling_pct: default_disk_ceiling_pct(),
            monitoring_interval_sec: default_monitoring_interval_sec(),
            cooldown_secs: default_cooldown_secs(),
            disk_path: None,
        }
    }
}

/// Remote generation endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct UpstreamConfig {
    /// Base URL; requests go to `{base_url}/chat/completions`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay after the first failed attempt; doubles on every further one.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Deadline for the whole upstream stage, retries and back-off included.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    /// Deadline for each individual attempt. Never extends the request deadline.
    #[serde(default = "default_attempt_timeout_sec")]
    pub attempt_timeout_sec: u64,
}

impl UpstreamConfig {
    /// `request_timeout_sec` as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    /// `attempt_timeout_sec` as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_sec)
    }

    /// `backoff_base_ms` as a [`Duration`].
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key_env: default_api_key_env(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            request_timeout_sec: default_request_timeout_sec(),
            attempt_timeout_sec: default_attempt_timeout_sec(),
        }
    }
}

/// Post-processing limits.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GenerationConfig {
    /// Longest accepted topic, in characters.
    #[serde(default = "default_max_topic_chars")]
    pub max_topic_chars: usize,
    /// Characters of raw model text kept by the parse fallback panel.
    #[serde(default = "default_fallback_chars")]
    pub fallback_chars: usize,
    /// Tier-1 text longer than this many characters is cut to one sentence.
    #[serde(default = "default_sentence_ceiling")]
    pub sentence_ceiling: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_topic_chars: default_max_topic_chars(),
            fallback_chars: default_fallback_chars(),
            sentence_ceiling: default_sentence_ceiling(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Pretty,
    /// Structured JSON lines.
    Json,
}

/// Observability settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log format used when `LOG_FORMAT` is unset.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Register Prometheus metrics at startup.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
        }
    }
}

/// Export the JSON Schema of [`OrchestratorConfig`].
///
/// # Errors
///
/// Returns a serialisation error if the schema cannot be rendered.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_documented_defaults() {
        let config: OrchestratorConfig = toml::from_str("").expect("test: empty TOML parses");
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.admission.max_concurrent_requests, 10);
        assert_eq!(config.admission.admission_timeout_ms, 1000);
        assert_eq!(config.upstream.max_retries, 3);
        assert_eq!(config.upstream.request_timeout_sec, 30);
        assert_eq!(config.health.monitoring_interval_sec, 30);
        assert_eq!(config.health.cooldown_secs, 5);
        assert_eq!(
            config.health.ceilings(),
            ResourceCeilings {
                memory_pct: 80.0,
                cpu_pct: 80.0,
                disk_pct: 90.0
            }
        );
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: OrchestratorConfig = toml::from_str(
            r#"
[admission]
max_concurrent_requests = 2

[upstream]
model = "local-model"
"#,
        )
        .expect("test: partial TOML parses");
        assert_eq!(config.admission.max_concurrent_requests, 2);
        assert_eq!(config.admission.admission_timeout_ms, 1000);
        assert_eq!(config.upstream.model, "local-model");
        assert_eq!(config.upstream.api_key_env, "COMIC_API_KEY");
    }

    #[test]
    fn test_log_format_parses_snake_case() {
        let config: OrchestratorConfig = toml::from_str("[observability]\nlog_format = \"json\"")
            .expect("test: log format parses");
        assert_eq!(config.observability.log_format, LogFormat::Json);
        assert!(config.observability.metrics_enabled);
    }

    #[test]
    fn test_duration_helpers() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.admission.acquire_timeout(), Duration::from_secs(1));
        assert_eq!(config.upstream.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.upstream.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.upstream.attempt_timeout(), Duration::from_secs(10));
        assert_eq!(config.health.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = OrchestratorConfig::default();
        config.health.disk_path = Some("/var/lib/comics".into());
        config.observability.log_format = LogFormat::Json;
        let text = toml::to_string_pretty(&config).expect("test: serialize to TOML");
        let back: OrchestratorConfig = toml::from_str(&text).expect("test: deserialize from TOML");
        assert_eq!(config, back);
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
