use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qualcode_harness::gateway::openrouter::{ChatProvider, OpenRouterAdapter};
use qualcode_harness::gateway::{
    Attribution, ChatModel, ChatRequest, FinishReason, GatewayConfig, Message, NoopUsageSink,
    ProviderError, ProviderGateway, TallyUsageSink,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn request(model: &str) -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter(model),
        vec![Message::system("protocol"), Message::user("item\n\nCode:")],
        Attribution::new("test"),
    )
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 3 }
    })
}

#[tokio::test]
async fn openrouter_parses_content_usage_and_cost() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "google/gemini-2.0-flash-001",
            "temperature": 0.0,
            "max_tokens": 128
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("1.3")))
        .mount(&server)
        .await;

    let req = request("google/gemini-2.0-flash-001").max_tokens(128);
    let resp = adapter(&server).chat(&req).await.unwrap();
    assert_eq!(resp.content, "1.3");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 3);
    assert_eq!(
        resp.cost_nanodollars,
        qualcode_harness::gateway::chat_cost("google/gemini-2.0-flash-001", 10, 3)
    );
}

#[tokio::test]
async fn uncodable_answer_is_content_not_a_refusal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("I cannot assign a category to this response.")),
        )
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request("m")).await.unwrap();
    assert!(resp.content.starts_with("I cannot assign"));
}

#[tokio::test]
async fn openrouter_classifies_http_429_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request("m")).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(60));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_usage_is_a_provider_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "2.1" }, "finish_reason": "stop" }]
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request("m")).await.unwrap_err();
    assert!(matches!(err, ProviderError::Provider { retryable: false, .. }));
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

#[tokio::test]
async fn provider_gateway_retries_server_errors_and_tallies_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first: ResponseTemplate::new(500).set_body_json(json!({
                "error": { "message": "transient error", "code": "internal" }
            })),
            second: ResponseTemplate::new(200).set_body_json(completion("ok")),
        })
        .mount(&server)
        .await;

    let sink = Arc::new(TallyUsageSink::new(NoopUsageSink));
    let gateway = ProviderGateway::with_config(
        adapter(&server),
        sink.clone(),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let resp = gateway.chat(request("m")).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);

    let totals = sink.totals();
    assert_eq!(totals.calls, 2);
    assert_eq!(totals.failed_calls, 1);
    assert_eq!(totals.input_tokens, 10);
}

#[tokio::test]
async fn provider_gateway_does_not_retry_client_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": 400 }
        })))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let err = gateway.chat(request("m")).await.unwrap_err();
    assert_eq!(err.code(), "provider_error");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
