//! # comic-orchestrator
//!
//! Admission-controlled generation pipeline that turns a topic string into a
//! multi-panel educational comic over Tokio.
//!
//! ## Architecture
//!
//! One request flows strictly sequentially through the stages below while
//! holding a single admission slot for its whole lifetime:
//! ```text
//! acquire → validate → prompt → RetryingGateway → SafetyFilter
//!         → ComplexityAdjuster → PanelNormalizer → Artifact → release
//! ```
//!
//! A background sampler publishes [`health::HealthSnapshot`] values that the
//! [`admission::AdmissionController`] uses to move between `Healthy` and
//! `Degraded`.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub mod admission;
pub mod complexity;
pub mod config;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod safety;
pub mod store;

// Re-exports for convenience
pub use admission::{AdmissionController, AdmissionState, AdmissionTicket};
pub use gateway::{ChatCompletionsClient, ContentGenerator, RetryingGateway, TemplateGenerator};
pub use health::{HealthSampler, HealthSnapshot};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pipeline::GenerationPipeline;

/// Smallest panel count a caller may request.
pub const MIN_PANELS: u8 = 3;
/// Largest panel count a caller may request.
pub const MAX_PANELS: u8 = 6;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::ConfigError`] if the global subscriber has
/// already been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => config::LogFormat::Json,
        _ => config::LogFormat::Pretty,
    };
    init_tracing_with(format)
}

/// Initialise the global tracing subscriber with an explicit output format,
/// typically `observability.log_format` from the config file.
///
/// # Errors
///
/// Same as [`init_tracing`].
pub fn init_tracing_with(format: config::LogFormat) -> Result<(), OrchestratorError> {
    let result = match format {
        config::LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        config::LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::ConfigError(format!("tracing init failed: {e}")))
}

// ── Errors ────────────────────────────────────────────────────────────────

/// Errors that cross the pipeline boundary.
///
/// Parsing and formatting faults never appear here: the gateway absorbs them
/// with deterministic fallback content. Every variant carries a machine-usable
/// [`code`](OrchestratorError::code) and a user-safe
/// [`user_message`](OrchestratorError::user_message).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The caller supplied a topic or options that cannot be processed.
    ///
    /// Raised before any remote call so rejected requests never consume a
    /// retry budget.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Specific validation failure.
        message: String,
        /// Hints the caller can act on.
        suggestions: Vec<String>,
    },

    /// The system is overloaded or degraded; the caller should back off.
    #[error("resource exhausted: {message}")]
    ResourceExhausted {
        /// Why admission was refused.
        message: String,
        /// Suggested delay before retrying.
        retry_after: Duration,
    },

    /// Every attempt against the generation endpoint timed out.
    #[error("upstream timed out after {attempts} attempt(s) in {elapsed:?} calling {endpoint}")]
    UpstreamTimeout {
        /// Endpoint that was called.
        endpoint: String,
        /// Number of attempts made.
        attempts: u32,
        /// Wall-clock time spent across all attempts.
        elapsed: Duration,
    },

    /// The generation endpoint failed after internal retries.
    #[error(
        "upstream error {code} from {endpoint} after {attempts} attempt(s) in {elapsed:?}: {message}"
    )]
    UpstreamError {
        /// Upstream error code (e.g. `HTTP_503`, `NETWORK_ERROR`).
        code: String,
        /// Sanitised description of the failure.
        message: String,
        /// Endpoint that was called.
        endpoint: String,
        /// Number of attempts made.
        attempts: u32,
        /// Wall-clock time spent across all attempts.
        elapsed: Duration,
        /// Whether a later resubmission may succeed.
        retryable: bool,
    },

    /// The caller cancelled the request before it finished.
    #[error("request cancelled")]
    Cancelled,

    /// A configuration value is missing or invalid (e.g., missing env var).
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first request.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for failures that do not fit a specific variant.
    #[error("unexpected failure: {0}")]
    UnexpectedFailure(String),
}

impl OrchestratorError {
    /// Build an [`OrchestratorError::InvalidInput`] from a message and hints.
    pub fn invalid_input<S: Into<String>>(message: impl Into<String>, suggestions: Vec<S>) -> Self {
        Self::InvalidInput {
            message: message.into(),
            suggestions: suggestions.into_iter().map(Into::into).collect(),
        }
    }

    /// Machine-usable error code.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Self::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            Self::UpstreamError { .. } => "UPSTREAM_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::UnexpectedFailure(_) => "UNEXPECTED_FAILURE",
        }
    }

    /// Message that is safe to show to an end user.
    ///
    /// Never includes endpoints, upstream bodies or other transport detail.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput {
                message,
                suggestions,
            } => {
                if suggestions.is_empty() {
                    message.clone()
                } else {
                    format!("{message} (suggestions: {})", suggestions.join("; "))
                }
            }
            Self::ResourceExhausted { retry_after, .. } => format!(
                "system busy, retry later (in about {}s)",
                retry_after.as_secs().max(1)
            ),
            Self::UpstreamTimeout { .. } | Self::UpstreamError { .. } => {
                "service temporarily unavailable, please retry shortly".to_string()
            }
            Self::Cancelled => "request cancelled".to_string(),
            Self::ConfigError(_) | Self::UnexpectedFailure(_) => {
                "an unexpected error occurred".to_string()
            }
        }
    }

    /// Whether the caller may resubmit the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } | Self::UpstreamTimeout { .. } => true,
            Self::UpstreamError { retryable, .. } => *retryable,
            Self::InvalidInput { .. }
            | Self::Cancelled
            | Self::ConfigError(_)
            | Self::UnexpectedFailure(_) => false,
        }
    }

    /// Suggested back-off before resubmitting, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ResourceExhausted { retry_after, .. } => Some(*retry_after),
            Self::UpstreamTimeout { .. } => Some(Duration::from_secs(30)),
            Self::UpstreamError {
                retryable: true, ..
            } => Some(Duration::from_secs(30)),
            _ => None,
        }
    }
}

// ── Generation options ────────────────────────────────────────────────────

/// Target-audience complexity level, youngest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AgeTier {
    /// Tier 1: pre-school readers.
    Preschool,
    /// Tier 2: early primary readers.
    EarlyPrimary,
    /// Tier 3: upper primary readers.
    UpperPrimary,
    /// Tier 4: teenagers.
    Teen,
}

impl AgeTier {
    /// Ordinal in `1..=4`.
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Preschool => 1,
            Self::EarlyPrimary => 2,
            Self::UpperPrimary => 3,
            Self::Teen => 4,
        }
    }

    /// Approximate reader age range, used in prompts.
    pub fn age_range(self) -> &'static str {
        match self {
            Self::Preschool => "3-5",
            Self::EarlyPrimary => "6-8",
            Self::UpperPrimary => "9-11",
            Self::Teen => "12-15",
        }
    }
}

impl TryFrom<u8> for AgeTier {
    type Error = OrchestratorError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Preschool),
            2 => Ok(Self::EarlyPrimary),
            3 => Ok(Self::UpperPrimary),
            4 => Ok(Self::Teen),
            other => Err(OrchestratorError::invalid_input(
                format!("age tier {other} is out of range"),
                vec!["use an age tier between 1 and 4"],
            )),
        }
    }
}

impl From<AgeTier> for u8 {
    fn from(tier: AgeTier) -> Self {
        tier.ordinal()
    }
}

/// Illustration style requested from the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualStyle {
    /// Bright cartoon line art.
    Cartoon,
    /// Soft watercolour.
    Watercolor,
    /// Realistic illustration.
    Realistic,
    /// Flat minimalist shapes.
    Minimalist,
}

impl VisualStyle {
    /// Prompt guidance for this style.
    pub fn description(self) -> &'static str {
        match self {
            Self::Cartoon => "bright, friendly cartoon style with clear outlines",
            Self::Watercolor => "soft watercolor style with gentle colors",
            Self::Realistic => "realistic illustration style with accurate details",
            Self::Minimalist => "simple minimalist style with flat shapes",
        }
    }
}

impl FromStr for VisualStyle {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cartoon" => Ok(Self::Cartoon),
            "watercolor" | "watercolour" => Ok(Self::Watercolor),
            "realistic" => Ok(Self::Realistic),
            "minimalist" | "minimal" => Ok(Self::Minimalist),
            other => Err(OrchestratorError::invalid_input(
                format!("unknown visual style '{other}'"),
                vec!["use one of: cartoon, watercolor, realistic, minimalist"],
            )),
        }
    }
}

/// Output language of the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    /// Simplified Chinese.
    #[serde(rename = "zh")]
    Chinese,
    /// English.
    #[serde(rename = "en")]
    English,
}

impl FromStr for Language {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" | "chinese" => Ok(Self::Chinese),
            "en" | "en-us" | "english" => Ok(Self::English),
            other => Err(OrchestratorError::invalid_input(
                format!("unknown language '{other}'"),
                vec!["use 'zh' or 'en'"],
            )),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chinese => write!(f, "zh"),
            Self::English => write!(f, "en"),
        }
    }
}

/// Immutable caller-selected generation options.
///
/// Construct through [`GenerationOptions::new`] to have the panel count
/// checked up front; deserialised values are checked again by
/// [`GenerationOptions::validate`] before the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Exact number of panels in the finished artifact, in `[3, 6]`.
    pub panel_count: u8,
    /// Target audience tier.
    pub age_tier: AgeTier,
    /// Illustration style.
    pub visual_style: VisualStyle,
    /// Output language.
    pub language: Language,
}

impl GenerationOptions {
    /// Build validated options.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidInput`] if `panel_count` is outside
    /// `[3, 6]`.
    pub fn new(
        panel_count: u8,
        age_tier: AgeTier,
        visual_style: VisualStyle,
        language: Language,
    ) -> Result<Self, OrchestratorError> {
        let options = Self {
            panel_count,
            age_tier,
            visual_style,
            language,
        };
        options.validate()?;
        Ok(options)
    }

    /// Check every field against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidInput`] naming the offending field.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(MIN_PANELS..=MAX_PANELS).contains(&self.panel_count) {
            return Err(OrchestratorError::invalid_input(
                format!(
                    "panel count {} is outside the allowed range {MIN_PANELS}-{MAX_PANELS}",
                    self.panel_count
                ),
                vec![format!(
                    "choose between {MIN_PANELS} and {MAX_PANELS} panels"
                )],
            ));
        }
        Ok(())
    }

    /// Return a copy with a different panel count (unvalidated).
    pub fn with_panel_count(mut self, panel_count: u8) -> Self {
        self.panel_count = panel_count;
        self
    }

    /// Return a copy with a different age tier.
    pub fn with_age_tier(mut self, age_tier: AgeTier) -> Self {
        self.age_tier = age_tier;
        self
    }

    /// Return a copy with a different language.
    pub fn with_language(mut self, language: Language) -> Self {
        self.language = language;
        self
    }

    /// Return a copy with a different visual style.
    pub fn with_visual_style(mut self, visual_style: VisualStyle) -> Self {
        self.visual_style = visual_style;
        self
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            panel_count: 4,
            age_tier: AgeTier::EarlyPrimary,
            visual_style: VisualStyle::Cartoon,
            language: Language::Chinese,
        }
    }
}

/// One caller submission. Ephemeral and owned by the caller.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Unique identifier for trace correlation.
    pub request_id: String,
    /// Raw topic text.
    pub topic: String,
    /// Generation options.
    pub options: GenerationOptions,
}

impl GenerationRequest {
    /// Create a request with a fresh request id.
    pub fn new(topic: impl Into<String>, options: GenerationOptions) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            options,
        }
    }
}

// ── Content ───────────────────────────────────────────────────────────────

/// One panel as returned by the remote generator. Untrusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPanel {
    /// Description for the illustrator.
    #[serde(default, alias = "image_description", alias = "description")]
    pub image_description: String,
    /// Dialogue lines, in speaking order.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub dialogue: Vec<String>,
    /// Optional narration box.
    #[serde(default)]
    pub narration: Option<String>,
}

/// Title plus a variable-length sequence of panels. Untrusted.
///
/// Each post-processing stage produces a new value of this shape rather than
/// mutating its input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContent {
    /// Comic title.
    #[serde(default)]
    pub title: String,
    /// Panels in reading order.
    pub panels: Vec<RawPanel>,
}

/// Accept dialogue either as a list of lines or a single string.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(line) => vec![line],
        OneOrMany::Many(lines) => lines,
        OneOrMany::Null(()) => Vec::new(),
    })
}

/// Where a finished panel came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelKind {
    /// Generated by the remote model.
    Story,
    /// Synthesised filler appended to reach the requested count.
    Supplementary,
    /// Synthesised closing panel; always the last appended filler.
    Summary,
    /// Canonical panel substituted for content that stayed unsafe.
    SafetyFallback,
}

/// One finished panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Panel {
    /// 1-based position in the artifact.
    pub index: usize,
    /// Provenance of the panel.
    pub kind: PanelKind,
    /// Description for the illustrator.
    pub image_description: String,
    /// Dialogue lines; never empty in a finished artifact.
    pub dialogue: Vec<String>,
    /// Optional narration box.
    pub narration: Option<String>,
}

impl Panel {
    /// Build a panel from a raw panel.
    pub fn from_raw(index: usize, kind: PanelKind, raw: &RawPanel) -> Self {
        Self {
            index,
            kind,
            image_description: raw.image_description.clone(),
            dialogue: raw.dialogue.clone(),
            narration: raw.narration.clone(),
        }
    }

    /// Iterate over every text field of the panel.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.image_description.as_str())
            .chain(self.dialogue.iter().map(String::as_str))
            .chain(self.narration.as_deref())
    }
}

/// The finished multi-panel output returned to a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Fresh identifier; also the persistence key.
    pub id: Uuid,
    /// Comic title.
    pub title: String,
    /// Topic as submitted.
    pub topic: String,
    /// Options the artifact was generated with.
    pub options: GenerationOptions,
    /// Exactly `options.panel_count` panels.
    pub panels: Vec<Panel>,
    /// Number of text fields rewritten by the safety filter.
    pub filtered_fields: usize,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Iterate over every text in the artifact, title included.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.title.as_str()).chain(self.panels.iter().flat_map(Panel::texts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_new_rejects_two_panels() {
        let result = GenerationOptions::new(
            2,
            AgeTier::EarlyPrimary,
            VisualStyle::Cartoon,
            Language::Chinese,
        );
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_options_new_accepts_full_range() {
        for count in MIN_PANELS..=MAX_PANELS {
            let options = GenerationOptions::default().with_panel_count(count);
            assert!(options.validate().is_ok(), "{count} panels must be valid");
        }
    }

    #[test]
    fn test_options_validate_rejects_seven_panels() {
        let options = GenerationOptions::default().with_panel_count(7);
        let err = options.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert!(err.user_message().contains("suggestions"));
    }

    #[test]
    fn test_age_tier_deserializes_from_integer() {
        let tier: AgeTier = serde_json::from_str("1").expect("test: tier 1 parses");
        assert_eq!(tier, AgeTier::Preschool);
        assert!(serde_json::from_str::<AgeTier>("5").is_err());
    }

    #[test]
    fn test_age_tier_serializes_to_ordinal() {
        let json = serde_json::to_string(&AgeTier::Teen).expect("test: serialize");
        assert_eq!(json, "4");
    }

    #[test]
    fn test_language_serializes_to_code() {
        let json = serde_json::to_string(&Language::Chinese).expect("test: serialize");
        assert_eq!(json, "\"zh\"");
        assert_eq!("EN".parse::<Language>().expect("test: parse"), Language::English);
    }

    #[test]
    fn test_visual_style_parse_rejects_unknown() {
        assert!("oil-painting".parse::<VisualStyle>().is_err());
        assert_eq!(
            "Watercolour".parse::<VisualStyle>().expect("test: parse"),
            VisualStyle::Watercolor
        );
    }

    #[test]
    fn test_raw_panel_accepts_snake_case_and_single_dialogue() {
        let panel: RawPanel = serde_json::from_str(
            r#"{"image_description": "a cat", "dialogue": "hello", "narration": null}"#,
        )
        .expect("test: parse");
        assert_eq!(panel.image_description, "a cat");
        assert_eq!(panel.dialogue, vec!["hello".to_string()]);
        assert!(panel.narration.is_none());
    }

    #[test]
    fn test_raw_content_requires_panels() {
        assert!(serde_json::from_str::<RawContent>(r#"{"title": "x"}"#).is_err());
        let content: RawContent =
            serde_json::from_str(r#"{"panels": []}"#).expect("test: parse");
        assert!(content.title.is_empty());
    }

    #[test]
    fn test_resource_exhausted_is_retryable_with_hint() {
        let err = OrchestratorError::ResourceExhausted {
            message: "no slots".into(),
            retry_after: Duration::from_secs(2),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(err.user_message().contains("system busy"));
    }

    #[test]
    fn test_upstream_user_message_hides_endpoint() {
        let err = OrchestratorError::UpstreamError {
            code: "HTTP_503".into(),
            message: "backend overloaded".into(),
            endpoint: "https://internal.example/chat/completions".into(),
            attempts: 4,
            elapsed: Duration::from_secs(7),
            retryable: true,
        };
        assert!(!err.user_message().contains("internal.example"));
        assert!(err.to_string().contains("HTTP_503"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_input_is_not_retryable() {
        let err = OrchestratorError::invalid_input("empty topic", Vec::<String>::new());
        assert!(!err.is_retryable());
        assert!(err.retry_after().is_none());
        assert_eq!(err.user_message(), "empty topic");
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
