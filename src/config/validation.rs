//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that
//! cannot be expressed through the type system alone (range checks, non-empty
//! strings).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::OrchestratorConfig;
use crate::OrchestratorError;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "health.cpu_ceiling_pct").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for OrchestratorError {
    fn from(e: ConfigError) -> Self {
        OrchestratorError::ConfigError(e.to_string())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Admission ────────────────────────────────────────────────────
    if config.admission.max_concurrent_requests == 0 {
        errors.push(invalid(
            "admission.max_concurrent_requests",
            0,
            "must be at least 1",
        ));
    }
    if config.admission.admission_timeout_ms == 0 {
        errors.push(invalid(
            "admission.admission_timeout_ms",
            0,
            "must be at least 1ms",
        ));
    }

    // ── Health ───────────────────────────────────────────────────────
    for (field, value) in [
        ("health.memory_ceiling_pct", config.health.memory_ceiling_pct),
        ("health.cpu_ceiling_pct", config.health.cpu_ceiling_pct),
        ("health.disk_ceiling_pct", config.health.disk_ceiling_pct),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            errors.push(invalid(field, value, "must be in (0, 100]"));
        }
    }
    if config.health.monitoring_interval_sec == 0 {
        errors.push(invalid(
            "health.monitoring_interval_sec",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Upstream ─────────────────────────────────────────────────────
    if config.upstream.base_url.trim().is_empty() {
        errors.push(invalid("upstream.base_url", "", "must not be empty"));
    }
    if config.upstream.model.trim().is_empty() {
        errors.push(invalid("upstream.model", "", "model name must not be empty"));
    }
    if config.upstream.api_key_env.trim().is_empty() {
        errors.push(invalid("upstream.api_key_env", "", "must not be empty"));
    }
    if !(0.0..=2.0).contains(&config.upstream.temperature) {
        errors.push(invalid(
            "upstream.temperature",
            config.upstream.temperature,
            "must be between 0.0 and 2.0",
        ));
    }
    if config.upstream.max_tokens == 0 {
        errors.push(invalid("upstream.max_tokens", 0, "must be at least 1"));
    }
    if config.upstream.request_timeout_sec == 0 {
        errors.push(invalid(
            "upstream.request_timeout_sec",
            0,
            "must be at least 1 second",
        ));
    }
    if config.upstream.attempt_timeout_sec == 0 {
        errors.push(invalid(
            "upstream.attempt_timeout_sec",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Generation ───────────────────────────────────────────────────
    if config.generation.max_topic_chars == 0 {
        errors.push(invalid("generation.max_topic_chars", 0, "must be at least 1"));
    }
    if config.generation.fallback_chars == 0 {
        errors.push(invalid("generation.fallback_chars", 0, "must be at least 1"));
    }
    if config.generation.sentence_ceiling == 0 {
        errors.push(invalid(
            "generation.sentence_ceiling",
            0,
            "must be at least 1",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
