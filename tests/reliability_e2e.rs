use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use qualcode_harness::cache::SqliteCodingCache;
use qualcode_harness::codebook::{Category, Codebook};
use qualcode_harness::coding::{CodingOptions, ItemOutcome, RunContext};
use qualcode_harness::gateway::openrouter::OpenRouterAdapter;
use qualcode_harness::gateway::{
    ChatGateway, ChatRequest, ChatResponse, FinishReason, GatewayConfig, NoopUsageSink,
    ProviderError, ProviderGateway,
};
use qualcode_harness::items::CodingItem;
use qualcode_harness::kappa::KappaMethod;
use qualcode_harness::protocol::ProtocolHistory;
use qualcode_harness::recommend::Recommendation;
use qualcode_harness::reliability::{
    render_report_markdown, run_reliability, score_collected, CollectedRow, ReliabilityError,
    ReliabilityItem, ReliabilityRequest,
};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Answers by keyword found in the last message; `FAIL` yields a transport error.
struct KeywordGateway {
    rules: Vec<(&'static str, &'static str)>,
    calls: AtomicUsize,
}

impl KeywordGateway {
    fn new(rules: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            rules,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ChatGateway for KeywordGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        // Earlier items finish later so ordering is actually exercised.
        if text.contains("slow") {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        let reply = self
            .rules
            .iter()
            .find(|(keyword, _)| text.contains(keyword))
            .map(|(_, reply)| *reply)
            .unwrap_or("no idea");
        if reply == "FAIL" {
            return Err(ProviderError::provider("openrouter", "upstream unavailable", false));
        }
        Ok(ChatResponse {
            content: reply.to_string(),
            input_tokens: 50,
            output_tokens: 2,
            cost_nanodollars: 10,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        })
    }
}

fn cat(code: &str) -> Category {
    code.parse().unwrap()
}

fn collected(response: &str, human: &str, output: &str) -> CollectedRow {
    CollectedRow {
        human: ReliabilityItem::new(CodingItem::new(response), human),
        model_output: output.to_string(),
    }
}

#[test]
fn agreeing_model_scores_one_and_proceeds() {
    let codebook = Codebook::trust_framework();
    let rows = vec![
        collected(
            "I trust them because they are competent",
            "1.1",
            "Primary code: 1.1 based on competence",
        ),
        collected(
            "I don't trust them, they lied",
            "1.3",
            "This reflects integrity concerns, code 1.3",
        ),
    ];
    let report = score_collected(&rows, &codebook).unwrap();

    let models: Vec<Category> = report.rows.iter().map(|r| r.model).collect();
    assert_eq!(models, vec![cat("1.1"), cat("1.3")]);
    assert_eq!(report.agreement.method, KappaMethod::Cohen);
    assert_eq!(report.agreement.kappa, 1.0);
    assert!(!report.agreement.degenerate);
    assert_eq!(report.recommendation, Recommendation::Proceed);
    assert_eq!(report.diagnostics.coded, 2);
    assert!(report.rows.iter().all(|r| r.all_agree()));
}

#[test]
fn unextractable_outputs_are_ordinary_disagreement() {
    let codebook = Codebook::trust_framework();
    let rows = vec![
        collected("a", "1.1", "I am not sure what this means."),
        collected("b", "1.1", "Hard to say."),
        collected("c", "1.1", ""),
    ];
    let report = score_collected(&rows, &codebook).unwrap();

    assert!(report.rows.iter().all(|r| r.model == Category::UNCODABLE));
    assert!(!report.agreement.degenerate);
    assert!(report.agreement.kappa.is_finite());
    assert!(report.agreement.kappa <= 0.0);
    assert_eq!(report.recommendation, Recommendation::RevisePrototype);
    assert_eq!(report.diagnostics.no_pattern, 3);
    assert_eq!(report.diagnostics.degraded_items(), 3);
}

#[test]
fn second_coder_switches_to_fleiss_and_reports_pairs() {
    let codebook = Codebook::trust_framework();
    let row = |h1: &str, h2: &str, out: &str| CollectedRow {
        human: ReliabilityItem::new(CodingItem::new("r"), h1).with_second_coder(h2),
        model_output: out.to_string(),
    };
    let rows = vec![
        row("1.1", "1.1", "1.1"),
        row("2.2", "2.2", "code 2.2"),
        row("3.1", "Institutional safeguards", "3.1"),
        row("1.4", "1.4", "9.9"),
    ];
    let report = score_collected(&rows, &codebook).unwrap();
    assert_eq!(report.agreement.method, KappaMethod::Fleiss);
    assert_eq!(report.agreement.n_raters, 3);
    assert_eq!(report.pairwise.len(), 3);
    assert_eq!(report.rows[2].human_2, Some(cat("3.1")));
    assert_eq!(report.rows[3].outcome, ItemOutcome::OutOfCodebook { found: cat("9.9") });
    assert_eq!(report.diagnostics.out_of_codebook, 1);

    let markdown = render_report_markdown(&report, &codebook);
    assert!(markdown.contains("Fleiss' kappa"));
    assert!(markdown.contains("## Pairwise"));
    assert!(markdown.contains("| Human-2 |"));
}

#[test]
fn mixed_second_coder_presence_is_rejected() {
    let codebook = Codebook::trust_framework();
    let rows = vec![
        CollectedRow {
            human: ReliabilityItem::new(CodingItem::new("a"), "1.1").with_second_coder("1.1"),
            model_output: "1.1".into(),
        },
        collected("b", "1.2", "1.2"),
    ];
    assert!(matches!(
        score_collected(&rows, &codebook),
        Err(ReliabilityError::MissingSecondCoder { index: 1 })
    ));
    assert!(matches!(
        score_collected(&[], &codebook),
        Err(ReliabilityError::NoItems)
    ));
}

#[tokio::test]
async fn live_run_preserves_order_and_counts_transport_failures() {
    let gateway = KeywordGateway::new(vec![
        ("competent", "1.1"),
        ("lied", "Code: 1.3"),
        ("outage", "FAIL"),
        ("weather", "Nothing to code here."),
    ]);
    let codebook = Codebook::trust_framework();
    let history = ProtocolHistory::default();
    let ctx = RunContext::new(&gateway, &codebook, history.current());

    let items = vec![
        ReliabilityItem::new(CodingItem::new("slow: they are competent"), "1.1"),
        ReliabilityItem::new(CodingItem::new("they lied to me"), "1.3"),
        ReliabilityItem::new(CodingItem::new("outage"), "1.2"),
        ReliabilityItem::new(CodingItem::new("nice weather"), "0.0"),
    ];
    let mut request = ReliabilityRequest::new(items);
    request.concurrency = 4;

    let report = run_reliability(&ctx, &request).await.unwrap();
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 4);

    let indices: Vec<usize> = report.rows.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(report.rows[0].model, cat("1.1"));
    assert_eq!(report.rows[1].model, cat("1.3"));
    assert_eq!(report.rows[2].model, Category::UNCODABLE);
    assert!(matches!(
        report.rows[2].outcome,
        ItemOutcome::TransportFailed { ref code, .. } if code == "provider_error"
    ));
    assert_eq!(report.rows[3].outcome, ItemOutcome::NoPattern);

    let d = report.diagnostics;
    assert_eq!((d.coded, d.no_pattern, d.transport_failed), (2, 1, 1));
    assert_eq!(report.usage.live_calls, 3);
    assert_eq!(report.usage.failures, 1);
    assert_eq!(report.protocol_version, Some(1));
    assert_eq!(report.model.as_deref(), Some(CodingOptions::default().model.as_str()));
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SqliteCodingCache::new(dir.path().join("cache.sqlite")).unwrap();
    let gateway = KeywordGateway::new(vec![("competent", "1.1"), ("lied", "1.3")]);
    let codebook = Codebook::trust_framework();
    let history = ProtocolHistory::default();
    let ctx = RunContext::new(&gateway, &codebook, history.current()).with_cache(&cache);

    let request = ReliabilityRequest::new(vec![
        ReliabilityItem::new(CodingItem::new("competent"), "1.1"),
        ReliabilityItem::new(CodingItem::new("lied"), "1.3"),
    ]);

    let first = run_reliability(&ctx, &request).await.unwrap();
    assert_eq!(first.usage.live_calls, 2);
    let second = run_reliability(&ctx, &request).await.unwrap();
    assert_eq!(second.usage.cache_hits, 2);
    assert_eq!(second.usage.live_calls, 0);
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
    assert_eq!(first.agreement.kappa, second.agreement.kappa);

    // A revised protocol misses the cache.
    let mut history = history;
    history.revise("Stricter protocol", qualcode_harness::protocol::RevisionSource::Manual);
    let revised = RunContext::new(&gateway, &codebook, history.current()).with_cache(&cache);
    let mut cache_only = request.clone();
    cache_only.options.cache_only = true;
    let third = run_reliability(&revised, &cache_only).await.unwrap();
    assert_eq!(third.diagnostics.not_cached, 2);
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn wiremock_run_through_provider_gateway() {
    let server = MockServer::start().await;
    let completion = |content: &str| {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 200, "completion_tokens": 4 }
        }))
    };
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("they are competent"))
        .respond_with(completion("Primary code: 1.1 based on competence"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("they lied"))
        .respond_with(completion("This reflects integrity concerns, code 1.3"))
        .mount(&server)
        .await;

    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    );
    let codebook = Codebook::trust_framework();
    let history = ProtocolHistory::default();
    let ctx = RunContext::new(&gateway, &codebook, history.current());

    let request = ReliabilityRequest::new(vec![
        ReliabilityItem::new(
            CodingItem::new("I trust them because they are competent").with_rating(5.0),
            "1.1",
        ),
        ReliabilityItem::new(CodingItem::new("I don't trust them, they lied"), "1.3"),
    ]);
    let report = run_reliability(&ctx, &request).await.unwrap();
    assert_eq!(report.agreement.kappa, 1.0);
    assert_eq!(report.recommendation, Recommendation::Proceed);
    assert_eq!(report.usage.input_tokens, 400);
    assert!(report.usage.cost_nanodollars > 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
