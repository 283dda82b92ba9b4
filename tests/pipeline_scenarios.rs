//! End-to-end behavior of the ledger, rule generation and the pipeline service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use ruleforge::dataset::{Dataset, InMemoryDatasetLoader, Value};
use ruleforge::ledger::{
    LedgerError, MemoryLedgerStore, Metadata, RunLedger, RunStatus, StepStatus, StepType,
};
use ruleforge::llm::TextGenerator;
use ruleforge::pipeline::{build_service, Collaborators, ForgeConfig, ResponseCode};
use ruleforge::rules::{
    BusinessRule, GeneratorKind, GeneratorRegistry, RuleExecutor, RuleRepository,
    SelfCorrectionLoop, Severity,
};

struct ScriptedTextGenerator {
    replies: Mutex<VecDeque<Option<String>>>,
    calls: AtomicUsize,
}

impl ScriptedTextGenerator {
    fn new(replies: Vec<Option<&str>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(|r| r.map(str::to_string)).collect()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TextGenerator for ScriptedTextGenerator {
    async fn generate(&self, _prompt: &str, _model: Option<&str>) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.replies.lock().unwrap().pop_front().flatten()
    }
}

fn ages(id: i64, values: &[i64]) -> Dataset {
    let rows = values.iter().map(|v| vec![Value::Int(*v)]).collect();
    Dataset::from_rows(id, &["age"], rows).unwrap()
}

async fn loader_with(datasets: Vec<Dataset>) -> Arc<InMemoryDatasetLoader> {
    let loader = Arc::new(InMemoryDatasetLoader::new());
    for dataset in datasets {
        loader.insert(dataset).await;
    }
    loader
}

fn correction_loop(llm: Option<Arc<ScriptedTextGenerator>>) -> SelfCorrectionLoop {
    let text: Option<Arc<dyn TextGenerator>> = llm.map(|l| l as Arc<dyn TextGenerator>);
    let registry = Arc::new(GeneratorRegistry::standard(
        text.clone(),
        None,
        GeneratorKind::Statistical,
        0.7,
    ));
    let correction = SelfCorrectionLoop::new(registry, RuleExecutor::default());
    match text {
        Some(text) => correction.with_repair(text, None),
        None => correction,
    }
}

#[tokio::test]
async fn scenario_a_statistical_range_and_not_null() {
    let dataset = Arc::new(ages(1, &[-5, 90, 41, 18]));
    let batch = correction_loop(None).run(Arc::clone(&dataset), "statistical").await;

    assert_eq!(batch.engine_used, "statistical");
    let conditions: Vec<&str> = batch.rules.iter().map(|r| r.condition.as_str()).collect();
    assert!(conditions.contains(&"age is not null"));
    assert!(conditions.contains(&"age >= -5 and age <= 90"));

    let range = batch
        .rules
        .iter()
        .find(|r| r.condition == "age >= -5 and age <= 90")
        .unwrap();
    let executor = RuleExecutor::default();
    assert!(executor.execute(range, &ages(1, &[-5])).success);

    let outlier = executor.execute(range, &ages(1, &[999]));
    assert!(!outlier.success);
    assert_eq!(outlier.affected_row_count, 1);
    assert_eq!(outlier.sample_violations, vec![0]);
}

#[tokio::test]
async fn scenario_b_reply_without_json_yields_empty_batch() {
    let llm = ScriptedTextGenerator::new(vec![Some("Ages should probably be positive.")]);
    let batch = correction_loop(Some(llm.clone()))
        .run(Arc::new(ages(2, &[30, 40])), "ai")
        .await;

    assert_eq!(batch.engine_used, "ai");
    assert_eq!(batch.initial_rules_count, 0);
    assert!(batch.rules.is_empty());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_c_missing_column_is_repaired() {
    let llm = ScriptedTextGenerator::new(vec![
        Some(r#"{"name": "age positive", "condition": "foo > 0", "severity": "high"}"#),
        Some("age > 0"),
    ]);
    let batch = correction_loop(Some(llm.clone()))
        .run(Arc::new(ages(3, &[30, 40])), "ai")
        .await;

    assert_eq!(batch.initial_rules_count, 1);
    assert_eq!(batch.failed_rules_count, 1);
    assert_eq!(batch.corrected_rules_count, 1);
    assert_eq!(batch.rules.len(), 1);
    assert_eq!(batch.rules[0].condition, "age > 0");
    assert_eq!(batch.rules[0].metadata["original_condition"], "foo > 0");
    // One generation call plus one repair call.
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        batch.corrected_rules_count + batch.discarded_count(),
        batch.failed_rules_count
    );
}

#[tokio::test]
async fn scenario_d_steps_may_run_out_of_order_by_default() {
    let loader = loader_with(vec![ages(42, &[1, 2, 3])]).await;
    let service = build_service(
        &ForgeConfig::new().with_workers(2),
        Collaborators::in_memory(loader),
    )
    .unwrap();

    let run_id = service.trigger_run(42, None).await.unwrap();
    let report = service.get_status(run_id, None).await.unwrap();
    assert_eq!(report.steps.len(), 4);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Pending));
    assert_eq!(report.run.status, RunStatus::Pending);

    let transform = report
        .steps
        .iter()
        .find(|s| s.step_type == StepType::Transform)
        .unwrap();
    let submission = service.run_step(transform.id, Metadata::new(), None).await.unwrap();
    submission.handle.wait().await.unwrap();

    let report = service.get_status(run_id, None).await.unwrap();
    assert_eq!(report.steps[0].status, StepStatus::Pending);
    assert_eq!(report.steps[1].status, StepStatus::Completed);
    assert_eq!(report.run.status, RunStatus::Running);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn strict_ordering_rejects_out_of_order_start() {
    let loader = loader_with(vec![ages(42, &[1, 2, 3])]).await;
    let service = build_service(
        &ForgeConfig::new().with_workers(1).with_enforce_step_order(true),
        Collaborators::in_memory(loader),
    )
    .unwrap();

    let run_id = service.trigger_run(42, None).await.unwrap();
    let transform = service
        .ledger()
        .find_step(run_id, StepType::Transform)
        .await
        .unwrap()
        .unwrap();

    let result = service.run_step(transform.id, Metadata::new(), None).await;
    assert_eq!(ResponseCode::of(&result), ResponseCode::InvalidState);
    assert_eq!(
        service.ledger().step(transform.id).await.unwrap().status,
        StepStatus::Pending
    );
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_start_of_running_step_conflicts() {
    let loader = loader_with(vec![ages(5, &[1])]).await;
    let ledger = RunLedger::new(Arc::new(MemoryLedgerStore::new()), loader);
    let run_id = ledger.create_run(5, None).await.unwrap();
    let step = ledger.find_step(run_id, StepType::Validate).await.unwrap().unwrap();

    ledger.start_step(step.id, Metadata::new()).await.unwrap();
    let second = ledger.start_step(step.id, Metadata::new()).await;
    assert!(matches!(
        second,
        Err(LedgerError::StateConflict {
            status: StepStatus::Running,
            ..
        })
    ));
}

#[tokio::test]
async fn run_completes_only_when_every_step_is_settled() {
    let loader = loader_with(vec![ages(6, &[1])]).await;
    let ledger = RunLedger::new(Arc::new(MemoryLedgerStore::new()), loader);
    let run_id = ledger.create_run(6, None).await.unwrap();
    let steps = ledger.get_status(run_id).await.unwrap().steps;

    for (i, step) in steps.iter().enumerate() {
        assert_ne!(ledger.run(run_id).await.unwrap().status, RunStatus::Completed);
        if i == 2 {
            ledger.skip_step(step.id, "not needed").await.unwrap();
        } else {
            ledger.start_step(step.id, Metadata::new()).await.unwrap();
            ledger.complete_step(step.id, Metadata::new()).await.unwrap();
        }
        let pending = ledger.resume_run(run_id).await.unwrap();
        for id in pending {
            let status = ledger.step(id).await.unwrap().status;
            assert!(!matches!(status, StepStatus::Completed | StepStatus::Skipped));
        }
    }

    let run = ledger.run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.completed_at.is_some());
    assert!(ledger.resume_run(run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_step_is_resumable_and_retryable() {
    let loader = loader_with(vec![ages(7, &[1])]).await;
    let ledger = RunLedger::new(Arc::new(MemoryLedgerStore::new()), loader);
    let run_id = ledger.create_run(7, None).await.unwrap();
    let step = ledger.find_step(run_id, StepType::Enrich).await.unwrap().unwrap();

    ledger.start_step(step.id, Metadata::new()).await.unwrap();
    ledger
        .fail_step(step.id, "enrichment source unreachable", Metadata::new())
        .await
        .unwrap();

    assert_eq!(ledger.retry_failed(run_id).await.unwrap(), vec![step.id]);
    assert!(ledger.resume_run(run_id).await.unwrap().contains(&step.id));
    let failed = ledger.step(step.id).await.unwrap();
    assert_eq!(failed.error.as_deref(), Some("enrichment source unreachable"));

    // A failed step may be started again.
    let restarted = ledger.start_step(step.id, Metadata::new()).await.unwrap();
    assert_eq!(restarted.status, StepStatus::Running);
}

#[tokio::test]
async fn rule_execution_is_idempotent() {
    let dataset = ages(8, &[10, -3, 40, -7]);
    let rule = BusinessRule::new(8, "non-negative age", "age >= 0");
    let executor = RuleExecutor::default();

    let first = executor.execute(&rule, &dataset);
    let second = executor.execute(&rule, &dataset);
    assert_eq!(first.success, second.success);
    assert_eq!(first.affected_row_count, second.affected_row_count);
    assert_eq!(first.affected_row_count, 2);
}

#[tokio::test]
async fn persisted_rule_round_trips_condition_text() {
    let repository = RuleRepository::in_memory();
    let rule = repository
        .create(BusinessRule::new(9, "x non-negative", "col_x >= 0").with_severity(Severity::High))
        .await
        .unwrap();

    let fetched = repository.get(rule.id).await.unwrap();
    assert_eq!(fetched.condition.as_bytes(), b"col_x >= 0");
    assert_eq!(fetched.severity, Severity::High);
}

#[tokio::test]
async fn invalid_condition_is_rejected_before_write() {
    let repository = RuleRepository::in_memory();
    let result = repository
        .create(BusinessRule::new(9, "broken", "age >= (0"))
        .await;
    assert!(result.is_err());
    assert!(repository.list_for_dataset(9, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn business_rules_step_persists_accepted_rules() {
    let loader = loader_with(vec![ages(11, &[-5, 90, 41])]).await;
    let service = build_service(
        &ForgeConfig::new().with_workers(1).with_business_rules_step(true),
        Collaborators::in_memory(loader),
    )
    .unwrap();

    let run_id = service.trigger_run(11, Some("ops")).await.unwrap();
    let step = service
        .ledger()
        .find_step(run_id, StepType::BusinessRules)
        .await
        .unwrap()
        .unwrap();

    let mut params = Metadata::new();
    params.insert("engine".into(), json!("statistical"));
    let submission = service.run_step(step.id, params, Some("ops")).await.unwrap();
    submission.handle.wait().await.unwrap();

    let done = service.ledger().step(step.id).await.unwrap();
    assert_eq!(done.status, StepStatus::Completed);
    assert_eq!(done.metadata["engine_used"], "statistical");

    let stored = service.repository().list_for_dataset(11, true).await.unwrap();
    assert!(!stored.is_empty());
    assert!(stored.iter().any(|r| r.condition == "age >= -5 and age <= 90"));

    let forbidden = service.get_status(run_id, Some("someone-else")).await;
    assert_eq!(ResponseCode::of(&forbidden), ResponseCode::Forbidden);
    service.shutdown().await.unwrap();
}
