//! End-to-end pipeline tests through the public orchestrator handle.
//!
//! A scripted generator stands in for the model endpoint so every scenario is
//! deterministic:
//! - short model output is padded to the requested panel count
//! - unsafe vocabulary never reaches the artifact
//! - invalid options are rejected before any remote call
//! - admission refuses the N+1th concurrent request
//! - tier 1 output is simplified and cut to one sentence

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use comic_orchestrator::config::OrchestratorConfig;
use comic_orchestrator::gateway::{ContentGenerator, GatewayError};
use comic_orchestrator::health::FixedMetrics;
use comic_orchestrator::prompt::Prompt;
use comic_orchestrator::{
    AgeTier, GenerationOptions, Language, Orchestrator, OrchestratorBuilder, OrchestratorError,
    PanelKind, VisualStyle,
};

struct ScriptedGenerator {
    body: String,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedGenerator {
    fn new(body: &str) -> Arc<Self> {
        Self::slow(body, Duration::ZERO)
    }

    fn slow(body: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            body: body.to_string(),
            delay,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, _prompt: &Prompt) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.body.clone())
    }

    fn endpoint(&self) -> String {
        "stub://scripted".to_string()
    }
}

fn start(config: OrchestratorConfig, generator: Arc<ScriptedGenerator>) -> Orchestrator {
    OrchestratorBuilder::new(config)
        .generator(generator)
        .metrics_provider(Arc::new(FixedMetrics::new(20.0, 20.0, 20.0)))
        .start()
        .expect("test: orchestrator starts")
}

const TWO_ADDITION_PANELS: &str = r#"{"title":"加法真有趣","panels":[
    {"imageDescription":"two apples on a table","dialogue":["一个苹果加一个苹果"],"narration":"小明在数苹果"},
    {"imageDescription":"a boy holding two apples","dialogue":["等于两个苹果！"]}
]}"#;

#[tokio::test]
async fn test_short_output_is_padded_with_summary_panel() {
    let generator = ScriptedGenerator::new(TWO_ADDITION_PANELS);
    let orchestrator = start(OrchestratorConfig::default(), generator.clone());

    let options = GenerationOptions::new(
        4,
        AgeTier::EarlyPrimary,
        VisualStyle::Cartoon,
        Language::Chinese,
    )
    .expect("test: valid options");
    let artifact = orchestrator
        .submit("加法运算", options)
        .await
        .expect("test: submit succeeds");

    assert_eq!(artifact.panels.len(), 4);
    let indices: Vec<usize> = artifact.panels.iter().map(|p| p.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    assert_eq!(artifact.panels[0].kind, PanelKind::Story);
    assert_eq!(artifact.panels[3].kind, PanelKind::Summary);
    assert!(artifact.panels[3].dialogue.iter().any(|line| line.contains("加法运算")));
    assert!(artifact.panels.iter().all(|p| !p.dialogue.is_empty()));
    assert_eq!(artifact.title, "加法真有趣");
    assert_eq!(generator.calls(), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_unsafe_keyword_never_reaches_artifact() {
    let body = r#"{"title":"学会分享","panels":[
        {"imageDescription":"children in a park","dialogue":["我们不喜欢暴力"]},
        {"imageDescription":"children sharing toys","dialogue":["大家一起玩"]},
        {"imageDescription":"children waving","dialogue":["再见！"]}
    ]}"#;
    let orchestrator = start(OrchestratorConfig::default(), ScriptedGenerator::new(body));

    let artifact = orchestrator
        .submit("分享", GenerationOptions::default().with_panel_count(3))
        .await
        .expect("test: submit succeeds");

    assert_eq!(artifact.panels.len(), 3);
    assert!(artifact.filtered_fields >= 1);
    for panel in &artifact.panels {
        for text in panel.texts() {
            assert!(!text.contains("暴力"), "unsafe text leaked: {text}");
        }
    }
    assert_eq!(artifact.panels[0].dialogue, vec!["我们不喜欢友爱".to_string()]);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_out_of_range_panel_count_skips_remote_call() {
    let generator = ScriptedGenerator::new(TWO_ADDITION_PANELS);
    let orchestrator = start(OrchestratorConfig::default(), generator.clone());

    for count in [2, 7] {
        let err = orchestrator
            .submit("加法运算", GenerationOptions::default().with_panel_count(count))
            .await
            .unwrap_err();
        assert!(
            matches!(err, OrchestratorError::InvalidInput { ref suggestions, .. } if !suggestions.is_empty()),
            "unexpected error: {err:?}"
        );
    }
    assert_eq!(generator.calls(), 0);

    let stats = orchestrator.stats().await;
    assert_eq!(stats.in_flight, 0);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_extra_concurrent_request_is_refused() {
    let mut config = OrchestratorConfig::default();
    config.admission.max_concurrent_requests = 2;
    config.admission.admission_timeout_ms = 50;
    let generator = ScriptedGenerator::slow(TWO_ADDITION_PANELS, Duration::from_millis(400));
    let orchestrator = start(config, generator);

    let options = GenerationOptions::default();
    let (a, b, c) = tokio::join!(
        orchestrator.submit("加法运算", options),
        orchestrator.submit("减法运算", options),
        orchestrator.submit("乘法运算", options),
    );

    let results = [a, b, c];
    let refused: Vec<&OrchestratorError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(refused.len(), 1, "exactly one request must be refused");
    assert_eq!(refused[0].code(), "RESOURCE_EXHAUSTED");
    assert!(refused[0].retry_after().is_some());
    assert!(refused[0].is_retryable());

    let stats = orchestrator.stats().await;
    assert_eq!(stats.acquired_total, 2);
    assert_eq!(stats.released_total, 2);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_preschool_text_is_simplified_to_one_sentence() {
    let body = r#"{"title":"Plants","panels":[
        {"imageDescription":"a sunflower","dialogue":["However, plants need sunlight. Then they grow very tall."]},
        {"imageDescription":"a watering can","dialogue":["Water helps too!"]},
        {"imageDescription":"a big tree","dialogue":["Trees are plants."]}
    ]}"#;
    let orchestrator = start(OrchestratorConfig::default(), ScriptedGenerator::new(body));

    let options = GenerationOptions::default()
        .with_panel_count(3)
        .with_age_tier(AgeTier::Preschool)
        .with_language(Language::English);
    let artifact = orchestrator
        .submit("plants", options)
        .await
        .expect("test: submit succeeds");

    assert_eq!(artifact.panels[0].dialogue, vec!["But, plants need sunlight.".to_string()]);
    assert_eq!(artifact.panels[1].dialogue, vec!["Water helps too!".to_string()]);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_finished_artifact_is_persisted() {
    let orchestrator = start(
        OrchestratorConfig::default(),
        ScriptedGenerator::new(TWO_ADDITION_PANELS),
    );

    let artifact = orchestrator
        .submit("加法运算", GenerationOptions::default())
        .await
        .expect("test: submit succeeds");
    let ids = orchestrator.store().list_ids().await.expect("test: list");
    assert_eq!(ids, vec![artifact.id]);
    orchestrator.shutdown().await;
}
