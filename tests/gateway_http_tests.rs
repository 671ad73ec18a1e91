//! Chat-completions gateway tests against a local mock server.
//!
//! Covers the HTTP client and the retrying wrapper together:
//! - a clean envelope is unwrapped and parsed into panels
//! - transient 5xx responses are retried up to the budget
//! - auth failures are surfaced after a single attempt
//! - prose and code fences around the JSON payload are tolerated

use std::sync::Arc;
use std::time::Duration;

use comic_orchestrator::prompt::build_prompt;
use comic_orchestrator::retry::RetryPolicy;
use comic_orchestrator::{
    ChatCompletionsClient, GenerationOptions, OrchestratorError, RetryingGateway,
};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COMIC_JSON: &str = r#"{"title":"加法","panels":[
    {"imageDescription":"two apples on a table","dialogue":["一个苹果加一个苹果"],"narration":"小明在数苹果"},
    {"imageDescription":"a boy counting on fingers","dialogue":["等于两个苹果！"]}
]}"#;

fn envelope(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

fn gateway(server: &MockServer, max_retries: u32) -> RetryingGateway {
    let client = ChatCompletionsClient::new(server.uri(), "test-key", "gpt-4o-mini");
    RetryingGateway::new(
        Arc::new(client),
        RetryPolicy::exponential(max_retries, Duration::from_millis(5)),
        Duration::from_secs(5),
        200,
    )
}

#[tokio::test]
async fn test_success_envelope_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(COMIC_JSON)))
        .expect(1)
        .mount(&server)
        .await;

    let prompt = build_prompt("加法运算", &GenerationOptions::default());
    let content = gateway(&server, 3)
        .call(&prompt)
        .await
        .expect("test: call succeeds");

    assert_eq!(content.title, "加法");
    assert_eq!(content.panels.len(), 2);
    assert_eq!(content.panels[1].dialogue, vec!["等于两个苹果！".to_string()]);
}

#[tokio::test]
async fn test_transient_503_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(COMIC_JSON)))
        .expect(1)
        .mount(&server)
        .await;

    let prompt = build_prompt("加法运算", &GenerationOptions::default());
    let content = gateway(&server, 3)
        .call(&prompt)
        .await
        .expect("test: third attempt succeeds");
    assert_eq!(content.panels.len(), 2);
}

#[tokio::test]
async fn test_persistent_503_exhausts_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let prompt = build_prompt("加法运算", &GenerationOptions::default());
    let err = gateway(&server, 2).call(&prompt).await.unwrap_err();

    assert!(
        matches!(
            err,
            OrchestratorError::UpstreamError { ref code, attempts: 3, retryable: true, .. }
                if code == "HTTP_503"
        ),
        "unexpected error: {err:?}"
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let prompt = build_prompt("加法运算", &GenerationOptions::default());
    let err = gateway(&server, 3).call(&prompt).await.unwrap_err();

    assert!(
        matches!(
            err,
            OrchestratorError::UpstreamError { ref code, attempts: 1, retryable: false, .. }
                if code == "HTTP_401"
        ),
        "unexpected error: {err:?}"
    );
}

#[tokio::test]
async fn test_payload_wrapped_in_prose_is_extracted() {
    let server = MockServer::start().await;
    let content = format!("Sure! Here is your comic:\n```json\n{COMIC_JSON}\n```\nEnjoy!");
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&content)))
        .mount(&server)
        .await;

    let prompt = build_prompt("加法运算", &GenerationOptions::default());
    let content = gateway(&server, 0)
        .call(&prompt)
        .await
        .expect("test: call succeeds");
    assert_eq!(content.title, "加法");
    assert_eq!(content.panels.len(), 2);
}

#[tokio::test]
async fn test_plain_text_reply_becomes_single_fallback_panel() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(envelope("I cannot draw comics today.")),
        )
        .mount(&server)
        .await;

    let prompt = build_prompt("photosynthesis", &GenerationOptions::default());
    let content = gateway(&server, 0)
        .call(&prompt)
        .await
        .expect("test: fallback never fails");
    assert_eq!(content.title, "photosynthesis");
    assert_eq!(content.panels.len(), 1);
}
