//! Content generation gateway
//!
//! Provides the [`ContentGenerator`] trait for the remote "generate content
//! from prompt" call, two implementations, and the [`RetryingGateway`] that
//! wraps exactly one such call with retries, per-attempt timeouts and payload
//! extraction:
//! - ChatCompletionsClient: OpenAI-compatible `POST {base}/chat/completions`
//! - TemplateGenerator: offline generator for demos and smoke tests
//!
//! ## Error boundary
//!
//! [`GatewayError`] stays inside this module. [`RetryingGateway::call`] maps
//! terminal failures to `UpstreamTimeout` / `UpstreamError` carrying an error
//! code, the elapsed time and the endpoint, and absorbs malformed payloads with
//! a synthesized single-panel fallback.
//!
//! ## Environment Variables
//!
//! - `COMIC_API_KEY` (or the name set in `upstream.api_key_env`): bearer token
//!   for [`ChatCompletionsClient`]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::prompt::Prompt;
use crate::retry::RetryPolicy;
use crate::{metrics, Language, OrchestratorError, RawContent, RawPanel};

/// Failure of a single generation attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The attempt did not finish within its deadline.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    /// The request never produced an HTTP response.
    #[error("network error: {0}")]
    Network(String),
    /// The endpoint answered with a non-success status.
    #[error("remote error {status}: {message}")]
    Remote {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        message: String,
    },
    /// The payload could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),
}

impl GatewayError {
    /// Whether another attempt may succeed.
    ///
    /// Authentication and malformed-request statuses are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Remote { status, .. } => {
                matches!(status, 408 | 409 | 425 | 429) || *status >= 500
            }
            Self::Parse(_) => false,
        }
    }

    /// Machine-usable code for this failure.
    pub fn code(&self) -> String {
        match self {
            Self::Timeout(_) => "TIMEOUT".to_string(),
            Self::Network(_) => "NETWORK_ERROR".to_string(),
            Self::Remote { status, .. } => format!("HTTP_{status}"),
            Self::Parse(_) => "PARSE_ERROR".to_string(),
        }
    }

    /// Description without transport detail.
    fn summary(&self) -> String {
        match self {
            Self::Timeout(limit) => format!("no response within {}ms", limit.as_millis()),
            Self::Network(_) => "could not reach the generation service".to_string(),
            Self::Remote { status, .. } => format!("generation service returned HTTP {status}"),
            Self::Parse(_) => "generation service returned an unreadable payload".to_string(),
        }
    }
}

/// Remote "generate content from prompt" call.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via
/// `Arc<dyn ContentGenerator>`.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Return the raw model text for `prompt`.
    async fn generate(&self, prompt: &Prompt) -> Result<String, GatewayError>;

    /// Endpoint identifier used in errors and logs.
    fn endpoint(&self) -> String;
}

// ============================================================================
// Chat-completions client
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// OpenAI-compatible chat-completions client.
///
/// ## Example
///
/// ```no_run
/// use comic_orchestrator::ChatCompletionsClient;
///
/// let client = ChatCompletionsClient::new("https://api.openai.com/v1", "sk-...", "gpt-4o-mini")
///     .with_temperature(0.7)
///     .with_max_tokens(2000);
/// ```
pub struct ChatCompletionsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ChatCompletionsClient {
    /// Create a client for `base_url` (the part before `/chat/completions`).
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.7,
            max_tokens: 2000,
        }
    }

    /// Create a client from the `[upstream]` config section.
    ///
    /// Reads the API key from the environment variable named by
    /// `upstream.api_key_env`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigError`] if the variable is unset or
    /// empty.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, OrchestratorError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                OrchestratorError::ConfigError(format!(
                    "{} environment variable not set",
                    config.api_key_env
                ))
            })?;

        Ok(Self::new(&config.base_url, api_key, &config.model)
            .with_temperature(config.temperature)
            .with_max_tokens(config.max_tokens))
    }

    /// Set the base URL (useful for self-hosted or mocked endpoints)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set temperature (0.0 - 2.0)
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set maximum tokens to generate
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ContentGenerator for ChatCompletionsClient {
    async fn generate(&self, prompt: &Prompt) -> Result<String, GatewayError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(Duration::ZERO)
                } else {
                    GatewayError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Remote {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        match serde_json::from_str::<ChatResponse>(&body) {
            Ok(parsed) => Ok(parsed
                .choices
                .into_iter()
                .next()
                .map(|choice| choice.message.content)
                .unwrap_or_default()),
            Err(e) => {
                warn!(error = %e, "chat envelope unreadable, passing raw body to extractor");
                Ok(body)
            }
        }
    }

    fn endpoint(&self) -> String {
        self.url()
    }
}

// ============================================================================
// Template generator (offline)
// ============================================================================

/// Offline generator that writes a well-formed comic for any prompt.
///
/// Useful for demos and pipeline smoke tests without a model endpoint.
pub struct TemplateGenerator {
    /// Simulated generation delay
    pub delay_ms: u64,
}

impl TemplateGenerator {
    /// Generator with a 10ms simulated delay.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Generator with a custom simulated delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, prompt: &Prompt) -> Result<String, GatewayError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;

        let topic = prompt.topic.as_str();
        let count = usize::from(prompt.panel_count);
        let panels: Vec<RawPanel> = (1..=count)
            .map(|i| {
                let (line, narration) = match prompt.language {
                    Language::Chinese if i == count => (
                        format!("原来{topic}这么有趣！"),
                        "我们一起回顾今天学到的内容。".to_string(),
                    ),
                    Language::Chinese => (
                        format!("第{i}步：我们来看看{topic}。"),
                        format!("小明和小红在学习{topic}。"),
                    ),
                    Language::English if i == count => (
                        format!("Now I know how {topic} works!"),
                        "Let's look back at what we learned.".to_string(),
                    ),
                    Language::English => (
                        format!("Step {i}: let's look at {topic}."),
                        format!("Two friends are learning about {topic}."),
                    ),
                };
                RawPanel {
                    image_description: format!(
                        "Two children exploring {topic} together, scene {i}"
                    ),
                    dialogue: vec![line],
                    narration: Some(narration),
                }
            })
            .collect();

        let content = RawContent {
            title: topic.to_string(),
            panels,
        };
        serde_json::to_string(&content).map_err(|e| GatewayError::Parse(e.to_string()))
    }

    fn endpoint(&self) -> String {
        "template://local".to_string()
    }
}

// ============================================================================
// Retrying gateway
// ============================================================================

/// Wraps one [`ContentGenerator`] with bounded retries, back-off, per-attempt
/// timeouts, an optional overall deadline and payload extraction.
pub struct RetryingGateway {
    generator: Arc<dyn ContentGenerator>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    request_timeout: Option<Duration>,
    fallback_chars: usize,
}

impl RetryingGateway {
    /// Create a gateway.
    ///
    /// # Arguments
    ///
    /// * `generator`: The wrapped remote call
    /// * `policy`: Retry budget and back-off schedule
    /// * `attempt_timeout`: Deadline for each individual attempt
    /// * `fallback_chars`: Characters of raw text kept by the parse fallback
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
        fallback_chars: usize,
    ) -> Self {
        Self {
            generator,
            policy,
            attempt_timeout,
            request_timeout: None,
            fallback_chars,
        }
    }

    /// Bound the whole call, retries and back-off included, by `deadline`.
    pub fn with_request_timeout(mut self, deadline: Duration) -> Self {
        self.request_timeout = Some(deadline);
        self
    }

    /// Call the generator and extract `{title, panels[]}` from its output.
    ///
    /// Retries timeouts, network failures and transient remote statuses with
    /// the configured back-off. A payload that cannot be parsed is replaced by
    /// a single synthesized panel; that fallback never fails.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::UpstreamTimeout`] if the final attempt timed out
    ///   or the request deadline expired
    /// - [`OrchestratorError::UpstreamError`] for any other terminal failure
    pub async fn call(&self, prompt: &Prompt) -> Result<RawContent, OrchestratorError> {
        let endpoint = self.generator.endpoint();
        let generator = &self.generator;
        let attempt_timeout = self.attempt_timeout;
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let run = self.policy.run(
            |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                async move {
                    debug!(attempt = attempt, "gateway: calling generator");
                    let result = tokio::time::timeout(attempt_timeout, generator.generate(prompt))
                        .await
                        .unwrap_or(Err(GatewayError::Timeout(attempt_timeout)));
                    metrics::inc_upstream_attempt(if result.is_ok() { "ok" } else { "err" });
                    result
                }
            },
            GatewayError::is_retryable,
        );

        let outcome = match self.request_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let attempts = attempts.load(Ordering::Relaxed);
                    let elapsed = started.elapsed();
                    warn!(
                        endpoint = %endpoint,
                        attempts = attempts,
                        deadline_ms = deadline.as_millis() as u64,
                        "gateway: request deadline expired"
                    );
                    metrics::inc_error("gateway", "deadline");
                    return Err(OrchestratorError::UpstreamTimeout {
                        endpoint,
                        attempts,
                        elapsed,
                    });
                }
            },
            None => run.await,
        };

        match outcome.result {
            Ok(raw) => Ok(extract_content(&raw, prompt, self.fallback_chars)),
            Err(GatewayError::Timeout(_)) => {
                warn!(
                    endpoint = %endpoint,
                    attempts = outcome.attempts,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "gateway: upstream timed out"
                );
                Err(OrchestratorError::UpstreamTimeout {
                    endpoint,
                    attempts: outcome.attempts,
                    elapsed: outcome.elapsed,
                })
            }
            Err(e) => {
                warn!(
                    endpoint = %endpoint,
                    attempts = outcome.attempts,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    error = %e,
                    "gateway: upstream failed"
                );
                Err(OrchestratorError::UpstreamError {
                    code: e.code(),
                    message: e.summary(),
                    endpoint,
                    attempts: outcome.attempts,
                    elapsed: outcome.elapsed,
                    retryable: e.is_retryable(),
                })
            }
        }
    }
}

// ============================================================================
// Payload extraction
// ============================================================================

/// Locate the first balanced `{...}` object in `text`.
///
/// Braces inside JSON strings (including escaped quotes) are ignored.
pub fn find_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract `{title, panels[]}` from raw model text.
///
/// Falls back to a single panel built from the first `fallback_chars`
/// characters of `raw` when no parseable object is found.
///
/// # Panics
///
/// This function never panics.
pub fn extract_content(raw: &str, prompt: &Prompt, fallback_chars: usize) -> RawContent {
    let parsed = find_json_object(raw)
        .ok_or_else(|| GatewayError::Parse("no JSON object found".to_string()))
        .and_then(|json| {
            serde_json::from_str::<RawContent>(json).map_err(|e| GatewayError::Parse(e.to_string()))
        });

    match parsed {
        Ok(content) => content,
        Err(e) => {
            warn!(error = %e, raw_len = raw.len(), "payload unparseable, using fallback panel");
            metrics::inc_error("gateway", "parse_fallback");
            fallback_content(raw, prompt, fallback_chars)
        }
    }
}

fn fallback_content(raw: &str, prompt: &Prompt, fallback_chars: usize) -> RawContent {
    let excerpt: String = raw.trim().chars().take(fallback_chars).collect();
    let line = if excerpt.trim().is_empty() {
        prompt.topic.clone()
    } else {
        excerpt.trim().to_string()
    };

    RawContent {
        title: prompt.topic.clone(),
        panels: vec![RawPanel {
            image_description: format!(
                "A friendly teacher explaining {} next to a simple picture",
                prompt.topic
            ),
            dialogue: vec![line],
            narration: None,
        }],
    }
}
