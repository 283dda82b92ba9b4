//! Pipeline execution: step handlers, dispatch, and the control surface.
//!
//! # Architecture
//!
//! - **Steps**: one handler per [`StepKind`] (clean, validate, profile,
//!   analyze, detect_anomalies, generate_embeddings, compute_quality_score,
//!   enrich, business_rules, custom_transform)
//! - **Dispatcher**: skip policy, per-step timing and advisory quality
//!   evaluation around a handler
//! - **Service**: `trigger_run`, `run_step`, `retry_failed`, `resume` and
//!   `get_status`, backed by the run ledger and a worker pool
//! - **Config**: [`ForgeConfig`], read from the environment
//!
//! # Example
//!
//! ```rust,ignore
//! use ruleforge::pipeline::{build_service, Collaborators, ForgeConfig};
//!
//! let config = ForgeConfig::from_env()?;
//! let service = build_service(&config, Collaborators::in_memory(datasets))?;
//!
//! let run_id = service.trigger_run(42, Some("analyst")).await?;
//! let submission = service.resume(run_id, Some("analyst")).await?;
//! submission.handle.wait().await?;
//!
//! let report = service.get_status(run_id, Some("analyst")).await?;
//! println!("{}: {:?}", report.run.status, report.counts);
//! ```

pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod service;
pub mod steps;

use std::sync::Arc;

pub use config::{ConfigError, ForgeConfig};
pub use dispatcher::{DispatchError, Dispatched, StatusMap, StepDispatcher, StepRules, StepTiming};
pub use evaluator::{Evaluation, Evaluator, EvaluatorError, HttpEvaluator, ProfileEvaluator, QualityScore};
pub use service::{PipelineService, ResponseCode, ServiceError, StepSubmission};
pub use steps::{
    run_handler, EmbeddingError, EmbeddingProvider, StepContext, StepError, StepKind, StepOutput,
    UnknownStep,
};

use crate::dataset::DatasetLoader;
use crate::ledger::{LedgerStore, MemoryLedgerStore, RunLedger};
use crate::llm::TextGenerator;
use crate::rules::{
    GeneratorKind, GeneratorRegistry, MemoryRuleStore, RuleCache, RuleExecutor, RuleRepository,
    RuleStore, SelfCorrectionLoop,
};
use crate::scheduler::StepWorkerPool;

/// External collaborators the service is assembled from.
pub struct Collaborators {
    pub datasets: Arc<dyn DatasetLoader>,
    pub ledger_store: Arc<dyn LedgerStore>,
    pub rule_store: Arc<dyn RuleStore>,
    pub llm: Option<Arc<dyn TextGenerator>>,
    pub embeddings: Option<Arc<dyn EmbeddingProvider>>,
}

impl Collaborators {
    /// In-memory ledger and rule stores over the given datasets.
    pub fn in_memory(datasets: Arc<dyn DatasetLoader>) -> Self {
        Self {
            datasets,
            ledger_store: Arc::new(MemoryLedgerStore::new()),
            rule_store: Arc::new(MemoryRuleStore::new()),
            llm: None,
            embeddings: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn TextGenerator>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embeddings(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embeddings = Some(provider);
        self
    }
}

/// Builds the generation and repair loop for a configuration.
///
/// # Errors
///
/// `InvalidValue` when the default engine names no known backend.
pub fn build_correction_loop(
    config: &ForgeConfig,
    llm: Option<Arc<dyn TextGenerator>>,
) -> Result<SelfCorrectionLoop, ConfigError> {
    let default_kind: GeneratorKind =
        config
            .default_engine
            .parse()
            .map_err(|e: crate::error::GeneratorError| ConfigError::InvalidValue {
                key: "RULEFORGE_DEFAULT_ENGINE".to_string(),
                message: e.to_string(),
            })?;

    let registry = Arc::new(GeneratorRegistry::standard(
        llm.clone(),
        config.model.clone(),
        default_kind,
        config.classifier_threshold,
    ));
    let mut correction =
        SelfCorrectionLoop::new(registry, RuleExecutor::default()).with_sample_size(config.sample_size);
    if let Some(llm) = llm {
        correction = correction.with_repair(llm, config.model.clone());
    }
    Ok(correction)
}

/// Assembles a running [`PipelineService`] from a configuration.
///
/// # Errors
///
/// `InvalidRequest` for an invalid configuration and `Internal` when the
/// worker pool cannot start.
pub fn build_service(config: &ForgeConfig, collaborators: Collaborators) -> Result<PipelineService, ServiceError> {
    config
        .validate()
        .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
    let correction = build_correction_loop(config, collaborators.llm.clone())
        .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;

    let repository = Arc::new(RuleRepository::new(
        collaborators.rule_store,
        Arc::new(RuleCache::new(config.cache_config())),
    ));
    let mut context = StepContext::new(
        repository,
        RuleExecutor::default(),
        Arc::new(correction),
        config.default_engine.clone(),
    );
    if let Some(provider) = collaborators.embeddings {
        context = context.with_embeddings(provider);
    }

    let evaluator: Arc<dyn Evaluator> = match &config.evaluator_url {
        Some(url) => Arc::new(HttpEvaluator::with_timeout(url.clone(), config.llm_timeout)),
        None => Arc::new(ProfileEvaluator),
    };
    let dispatcher = Arc::new(StepDispatcher::new(context).with_evaluator(evaluator));

    let ledger = Arc::new(
        RunLedger::new(collaborators.ledger_store, Arc::clone(&collaborators.datasets))
            .with_options(config.ledger_options()),
    );
    let pool = Arc::new(StepWorkerPool::new(config.pool_config()));

    Ok(PipelineService::new(ledger, collaborators.datasets, dispatcher, pool)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, InMemoryDatasetLoader, Value};
    use crate::ledger::StepType;

    #[test]
    fn test_correction_loop_rejects_unknown_engine() {
        let config = ForgeConfig::new().with_default_engine("oracle");
        assert!(matches!(
            build_correction_loop(&config, None),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_build_service_honors_business_rules_step() {
        let loader = Arc::new(InMemoryDatasetLoader::new());
        loader
            .insert(Dataset::from_rows(3, &["a"], vec![vec![Value::Int(1)]]).unwrap())
            .await;

        let config = ForgeConfig::new().with_workers(1).with_business_rules_step(true);
        let service = build_service(&config, Collaborators::in_memory(loader)).unwrap();
        let run_id = service.trigger_run(3, None).await.unwrap();

        let report = service.get_status(run_id, None).await.unwrap();
        assert_eq!(report.steps.len(), 5);
        assert_eq!(report.steps[4].step_type, StepType::BusinessRules);
        service.shutdown().await.unwrap();
    }

    #[test]
    fn test_build_service_validates_config() {
        let loader = Arc::new(InMemoryDatasetLoader::new());
        let config = ForgeConfig::new().with_workers(0);
        let result = build_service(&config, Collaborators::in_memory(loader));
        assert_eq!(ResponseCode::of(&result), ResponseCode::InvalidRequest);
    }
}
