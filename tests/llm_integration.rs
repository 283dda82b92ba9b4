//! Integration tests for the LLM client and AI rule generation.
//!
//! These tests make real API calls to a LiteLLM-compatible endpoint.
//! Run with: LITELLM_API_BASE=http://localhost:4000 cargo test --test llm_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use ruleforge::dataset::{Dataset, Value};
use ruleforge::llm::{
    GenerationRequest, LiteLlmClient, LlmProvider, LlmTextGenerator, Message, RetryConfig,
    TextGenerator,
};
use ruleforge::rules::{GeneratorKind, GeneratorRegistry, RuleExecutor, SelfCorrectionLoop};

fn create_test_client() -> LiteLlmClient {
    LiteLlmClient::from_env()
        .expect("LITELLM_API_BASE environment variable must be set for integration tests")
}

fn orders() -> Dataset {
    let rows = (1..=30)
        .map(|i| {
            vec![
                Value::Int(i),
                Value::Float(10.0 * i as f64),
                Value::Str(if i % 3 == 0 { "shipped" } else { "pending" }.to_string()),
            ]
        })
        .collect();
    Dataset::from_rows(1, &["order_id", "amount", "status"], rows).expect("valid dataset")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        "",
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    let content = response.first_content().expect("Should have content");
    assert!(content.contains('4'), "Response should contain '4', got: {}", content);
}

#[tokio::test]
#[ignore]
async fn test_gateway_returns_text() {
    let client = create_test_client();
    let model = client.default_model().to_string();
    let gateway = LlmTextGenerator::new(Arc::new(client), model)
        .with_timeout(Duration::from_secs(60))
        .with_retry(RetryConfig::new(1));

    let reply = gateway
        .generate("Reply with the single word: ready", None)
        .await
        .expect("Gateway should return text");
    assert!(!reply.trim().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_ai_rules_are_tested_before_acceptance() {
    let client = create_test_client();
    let model = client.default_model().to_string();
    let llm: Arc<dyn TextGenerator> = Arc::new(
        LlmTextGenerator::new(Arc::new(client), model).with_timeout(Duration::from_secs(90)),
    );
    let registry = Arc::new(GeneratorRegistry::standard(
        Some(Arc::clone(&llm)),
        None,
        GeneratorKind::AiPrompt,
        0.7,
    ));
    let correction = SelfCorrectionLoop::new(registry, RuleExecutor::default()).with_repair(llm, None);

    let dataset = Arc::new(orders());
    let batch = correction.run(Arc::clone(&dataset), "ai").await;

    assert_eq!(batch.engine_used, "ai");
    assert_eq!(
        batch.corrected_rules_count + batch.discarded_count(),
        batch.failed_rules_count
    );
    let executor = RuleExecutor::default();
    for rule in &batch.rules {
        assert!(executor.execute(rule, &dataset).success, "{}", rule.condition);
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_degrades_to_none() {
    // Bind then release a port so nothing is listening on it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let client = LiteLlmClient::new(format!("http://127.0.0.1:{}", port), None, "test-model".to_string());
    let gateway = LlmTextGenerator::new(Arc::new(client), "test-model")
        .with_timeout(Duration::from_secs(2))
        .with_retry(RetryConfig::new(0));

    assert!(gateway.generate("test", None).await.is_none());
}
