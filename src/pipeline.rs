//! Generation pipeline.
//!
//! One request runs these stages strictly in order while holding a single
//! admission slot:
//!
//! ```text
//! acquire → validate → prompt → gateway → safety → complexity
//!         → normalize → back-fill → safety sweep → Artifact → release
//! ```
//!
//! ## Span Fields
//!
//! Every request runs inside `pipeline.generate`:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `request_id` | Unique ID for trace correlation |
//! | `panel_count` | Requested panel count |
//! | `age_tier` | Requested age tier ordinal |
//! | `duration_ms` | Recorded after the request finishes |
//! | `outcome` | `"ok"` or `"err"` |
//! | `error_kind` | Recorded only on error, the error code |
//!
//! ## Sensitive Fields (never logged at info)
//!
//! - Topic text
//! - Generated titles, dialogue and narration
//! - API keys

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::complexity::ComplexityAdjuster;
use crate::config::GenerationConfig;
use crate::gateway::RetryingGateway;
use crate::normalize::PanelNormalizer;
use crate::prompt::build_prompt;
use crate::safety::SafetyFilter;
use crate::{
    metrics, Artifact, GenerationRequest, OrchestratorError, Panel, PanelKind,
};

/// Runs one request from admission to assembled [`Artifact`].
pub struct GenerationPipeline {
    admission: Arc<AdmissionController>,
    gateway: RetryingGateway,
    safety: SafetyFilter,
    complexity: ComplexityAdjuster,
    max_topic_chars: usize,
}

impl GenerationPipeline {
    /// Create a pipeline.
    ///
    /// # Arguments
    ///
    /// * `admission`: Shared concurrency gate
    /// * `gateway`: Wrapped remote generation call
    /// * `generation`: Topic limit and post-processing settings
    pub fn new(
        admission: Arc<AdmissionController>,
        gateway: RetryingGateway,
        generation: &GenerationConfig,
    ) -> Self {
        Self {
            admission,
            gateway,
            safety: SafetyFilter::new(),
            complexity: ComplexityAdjuster::new(generation.sentence_ceiling),
            max_topic_chars: generation.max_topic_chars,
        }
    }

    /// Replace the built-in safety filter.
    pub fn with_safety_filter(mut self, safety: SafetyFilter) -> Self {
        self.safety = safety;
        self
    }

    /// The admission controller this pipeline acquires from.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Run one request.
    ///
    /// The admission slot is held for the whole run and returned on every
    /// exit path, including when this future is dropped mid-flight.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ResourceExhausted`] if admission is refused
    /// - [`OrchestratorError::InvalidInput`] for a rejected topic or options,
    ///   before any remote call
    /// - [`OrchestratorError::UpstreamTimeout`] / [`OrchestratorError::UpstreamError`]
    ///   if the gateway gives up
    pub async fn run(&self, request: &GenerationRequest) -> Result<Artifact, OrchestratorError> {
        let span = tracing::info_span!(
            "pipeline.generate",
            request_id = %request.request_id,
            panel_count = request.options.panel_count,
            age_tier = request.options.age_tier.ordinal(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
            error_kind = tracing::field::Empty,
        );

        let start = Instant::now();
        let result = async {
            let ticket = self.admission.acquire().await?;
            let result = self.execute(request).await;
            self.admission.release(ticket);
            result
        }
        .instrument(span.clone())
        .await;

        let elapsed = start.elapsed();
        span.record("duration_ms", elapsed.as_millis() as u64);
        metrics::record_stage_latency("total", elapsed);

        match &result {
            Ok(artifact) => {
                span.record("outcome", "ok");
                metrics::inc_request("ok");
                span.in_scope(|| {
                    info!(
                        artifact_id = %artifact.id,
                        panels = artifact.panels.len(),
                        filtered_fields = artifact.filtered_fields,
                        duration_ms = elapsed.as_millis() as u64,
                        "comic generated"
                    );
                });
            }
            Err(e) => {
                span.record("outcome", "err");
                span.record("error_kind", e.code());
                metrics::inc_request(e.code());
                metrics::inc_error("pipeline", e.code());
                span.in_scope(|| {
                    warn!(error_kind = e.code(), error = %e, "comic generation failed");
                });
            }
        }

        result
    }

    async fn execute(&self, request: &GenerationRequest) -> Result<Artifact, OrchestratorError> {
        let options = request.options;

        let stage = Instant::now();
        let topic = self.validate_topic(&request.topic)?;
        options.validate()?;
        metrics::record_stage_latency("validate", stage.elapsed());

        let prompt = build_prompt(topic, &options);

        let stage = Instant::now();
        let raw = self.gateway.call(&prompt).await;
        metrics::record_stage_latency("gateway", stage.elapsed());
        let raw = raw?;
        debug!(raw_panels = raw.panels.len(), "gateway returned content");

        let stage = Instant::now();
        let filtered = self.safety.filter_content(&raw, options.language);
        let adjusted = self.complexity.adjust_content(&filtered.content, options.age_tier);

        let panels: Vec<Panel> = adjusted
            .panels
            .iter()
            .enumerate()
            .map(|(position, panel)| {
                let kind = if filtered.fallback_panels.contains(&position) {
                    PanelKind::SafetyFallback
                } else {
                    PanelKind::Story
                };
                Panel::from_raw(position + 1, kind, panel)
            })
            .collect();

        let normalizer = PanelNormalizer::new(topic, options.language);
        let panels = normalizer.normalize(&panels, usize::from(options.panel_count));
        let panels = normalizer.backfill_dialogue(panels);
        let (panels, swept) = self.safety.sweep_panels(panels, options.language);

        let title = if adjusted.title.trim().is_empty() {
            topic.to_string()
        } else {
            adjusted.title.trim().to_string()
        };
        let title = self.safety.filter(&title);
        metrics::record_stage_latency("postprocess", stage.elapsed());

        let filtered_fields = filtered.filtered_fields + swept + usize::from(title.was_filtered);
        if !filtered.fallback_panels.is_empty() {
            debug!(
                replaced = filtered.fallback_panels.len(),
                "unsafe panels replaced with fallback"
            );
        }

        Ok(Artifact {
            id: Uuid::new_v4(),
            title: title.text,
            topic: topic.to_string(),
            options,
            panels,
            filtered_fields,
            created_at: Utc::now(),
        })
    }

    /// Trim and check a topic. Runs before any remote call.
    fn validate_topic<'a>(&self, topic: &'a str) -> Result<&'a str, OrchestratorError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(OrchestratorError::invalid_input(
                "topic must not be empty",
                vec!["enter a subject such as \"加法运算\" or \"photosynthesis\""],
            ));
        }

        let chars = topic.chars().count();
        if chars > self.max_topic_chars {
            return Err(OrchestratorError::invalid_input(
                format!(
                    "topic is {chars} characters long; the limit is {}",
                    self.max_topic_chars
                ),
                vec![format!(
                    "shorten the topic to at most {} characters",
                    self.max_topic_chars
                )],
            ));
        }

        if self.safety.contains_unsafe(topic) {
            return Err(OrchestratorError::invalid_input(
                "topic contains content that is not suitable for children",
                vec!["choose an educational subject such as science, maths or history"],
            ));
        }

        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ResourceCeilings;
    use crate::gateway::{ContentGenerator, GatewayError};
    use crate::prompt::Prompt;
    use crate::retry::RetryPolicy;
    use crate::{GenerationOptions, Language};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CannedGenerator {
        body: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ContentGenerator for CannedGenerator {
        async fn generate(&self, _prompt: &Prompt) -> Result<String, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }

        fn endpoint(&self) -> String {
            "stub://canned".to_string()
        }
    }

    fn pipeline(body: &str, slots: usize) -> (GenerationPipeline, Arc<CannedGenerator>) {
        let generator = Arc::new(CannedGenerator {
            body: body.to_string(),
            calls: AtomicU32::new(0),
        });
        let admission = Arc::new(AdmissionController::new(
            slots,
            Duration::from_millis(20),
            Duration::from_millis(10),
            ResourceCeilings::default(),
        ));
        let gateway = RetryingGateway::new(
            generator.clone(),
            RetryPolicy::exponential(1, Duration::from_millis(1)),
            Duration::from_secs(1),
            200,
        );
        (
            GenerationPipeline::new(admission, gateway, &GenerationConfig::default()),
            generator,
        )
    }

    const TWO_PANELS: &str = r#"{"title":"加法","panels":[
        {"imageDescription":"two apples","dialogue":["一个苹果加一个苹果"],"narration":"小明数苹果"},
        {"imageDescription":"three apples","dialogue":["等于两个苹果！"]}
    ]}"#;

    #[tokio::test]
    async fn test_run_pads_to_requested_count_with_summary() {
        let (pipeline, _) = pipeline(TWO_PANELS, 2);
        let request = GenerationRequest::new("加法运算", GenerationOptions::default());
        let artifact = pipeline.run(&request).await.expect("test: run succeeds");

        assert_eq!(artifact.panels.len(), 4);
        assert_eq!(artifact.panels[3].kind, PanelKind::Summary);
        assert_eq!(artifact.topic, "加法运算");
        assert!(artifact.panels.iter().all(|p| !p.dialogue.is_empty()));
    }

    #[tokio::test]
    async fn test_run_rejects_bad_topics_without_remote_call() {
        let (pipeline, generator) = pipeline(TWO_PANELS, 2);
        let long = "a".repeat(101);
        for topic in ["   ", long.as_str(), "暴力游戏"] {
            let request = GenerationRequest::new(topic, GenerationOptions::default());
            let err = pipeline.run(&request).await.unwrap_err();
            assert_eq!(err.code(), "INVALID_INPUT", "topic {topic:?}");
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_releases_slot_on_every_exit_path() {
        let (pipeline, _) = pipeline(TWO_PANELS, 1);
        let bad = GenerationRequest::new("", GenerationOptions::default());
        let good = GenerationRequest::new("加法运算", GenerationOptions::default());

        assert!(pipeline.run(&bad).await.is_err());
        assert!(pipeline.run(&good).await.is_ok());
        assert!(pipeline.run(&bad).await.is_err());

        let stats = pipeline.admission().stats().await;
        assert_eq!(stats.acquired_total, 3);
        assert_eq!(stats.released_total, 3);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_blank_title_falls_back_to_topic() {
        let (pipeline, _) = pipeline(r#"{"panels":[]}"#, 1);
        let request = GenerationRequest::new(
            " photosynthesis ",
            GenerationOptions::default().with_language(Language::English),
        );
        let artifact = pipeline.run(&request).await.expect("test: run succeeds");
        assert_eq!(artifact.title, "photosynthesis");
        assert_eq!(artifact.panels.len(), 4);
    }
}
