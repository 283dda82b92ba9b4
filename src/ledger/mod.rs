//! Persistent state machine for pipeline runs and their steps.
//!
//! A run gets one pending step per step type at creation. Steps move
//! `pending → running → {completed | failed}`; failed and pending steps may
//! be started again. Every transition is written through the
//! [`LedgerStore`] before the call returns, and the run status is recomputed
//! from its steps after each step transition.
//!
//! Starting a step is a conditional write against the stored status, so two
//! concurrent starts of the same step cannot both succeed.

mod lifecycle;
pub mod model;
pub mod store;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use lifecycle::StepLifecycle;
pub use model::{
    merge_metadata, Metadata, PipelineRun, PipelineStep, RunId, RunStatus, RunStatusReport,
    StepCounts, StepId, StepStatus, StepType,
};
pub use store::{LedgerStore, MemoryLedgerStore};

use crate::dataset::{DatasetId, DatasetLoader};

/// Errors raised by the run ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Step {step_id} is {status}; transition rejected")]
    StateConflict { step_id: StepId, status: StepStatus },

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Step {0} not found")]
    StepNotFound(StepId),

    #[error("Dataset {0} not found")]
    DatasetNotFound(DatasetId),

    #[error("Step '{step}' cannot start before '{blocking}' has completed")]
    OrderViolation { step: StepType, blocking: StepType },

    #[error("Ledger store error: {0}")]
    Store(String),
}

/// Ledger behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerOptions {
    /// Reject starting a step while an earlier step is not completed or skipped.
    pub enforce_step_order: bool,
    /// Create a `business_rules` step for every run.
    pub include_business_rules_step: bool,
}

/// The run ledger.
pub struct RunLedger {
    store: Arc<dyn LedgerStore>,
    datasets: Arc<dyn DatasetLoader>,
    lifecycle: StepLifecycle,
    options: LedgerOptions,
}

impl RunLedger {
    pub fn new(store: Arc<dyn LedgerStore>, datasets: Arc<dyn DatasetLoader>) -> Self {
        Self {
            store,
            datasets,
            lifecycle: StepLifecycle::new(),
            options: LedgerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LedgerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> LedgerOptions {
        self.options
    }

    /// Creates a pending run with one pending step per step type.
    ///
    /// # Errors
    ///
    /// `DatasetNotFound` when the dataset service does not know the id.
    pub async fn create_run(
        &self,
        dataset_id: DatasetId,
        owner: Option<String>,
    ) -> Result<RunId, LedgerError> {
        if !self.datasets.exists(dataset_id).await {
            return Err(LedgerError::DatasetNotFound(dataset_id));
        }

        let run = PipelineRun::new(dataset_id, owner);
        let steps: Vec<PipelineStep> = StepType::for_run(self.options.include_business_rules_step)
            .into_iter()
            .map(|t| PipelineStep::pending(run.id, t))
            .collect();
        self.store.insert_run(&run, &steps).await?;

        info!(run_id = %run.id, dataset_id, steps = steps.len(), "Pipeline run created");
        Ok(run.id)
    }

    /// Moves a pending or failed step to running and merges `params` into its metadata.
    ///
    /// # Errors
    ///
    /// `StateConflict` when the step is running, completed or skipped
    /// (including when another caller started it first), and
    /// `OrderViolation` when step ordering is enforced and an earlier step
    /// is not settled.
    pub async fn start_step(&self, step_id: StepId, params: Metadata) -> Result<PipelineStep, LedgerError> {
        let step = self.step(step_id).await?;
        if !self.lifecycle.can_transition(step.status, StepStatus::Running) {
            return Err(LedgerError::StateConflict {
                step_id,
                status: step.status,
            });
        }

        if self.options.enforce_step_order {
            let blocking = self
                .store
                .list_steps(step.run_id)
                .await?
                .into_iter()
                .filter(|s| s.step_type.position() < step.step_type.position())
                .find(|s| !s.status.is_settled());
            if let Some(blocking) = blocking {
                return Err(LedgerError::OrderViolation {
                    step: step.step_type,
                    blocking: blocking.step_type,
                });
            }
        }

        let mut updated = step.clone();
        updated.status = StepStatus::Running;
        updated.started_at = Some(Utc::now());
        updated.completed_at = None;
        updated.error = None;
        merge_metadata(&mut updated.metadata, params);

        self.transition(updated, StepStatus::Running).await
    }

    /// Marks a running step completed and merges `metadata`.
    pub async fn complete_step(&self, step_id: StepId, metadata: Metadata) -> Result<PipelineStep, LedgerError> {
        let mut updated = self.step(step_id).await?;
        updated.status = StepStatus::Completed;
        updated.completed_at = Some(Utc::now());
        updated.error = None;
        merge_metadata(&mut updated.metadata, metadata);
        self.transition(updated, StepStatus::Completed).await
    }

    /// Marks a running step failed with `error` and merges `metadata`.
    pub async fn fail_step(
        &self,
        step_id: StepId,
        error: impl Into<String>,
        metadata: Metadata,
    ) -> Result<PipelineStep, LedgerError> {
        let mut updated = self.step(step_id).await?;
        updated.status = StepStatus::Failed;
        updated.completed_at = Some(Utc::now());
        updated.error = Some(error.into());
        merge_metadata(&mut updated.metadata, metadata);
        self.transition(updated, StepStatus::Failed).await
    }

    /// Marks a step skipped. A skipped step counts as satisfied for the run.
    pub async fn skip_step(&self, step_id: StepId, reason: &str) -> Result<PipelineStep, LedgerError> {
        let mut updated = self.step(step_id).await?;
        updated.status = StepStatus::Skipped;
        updated.completed_at = Some(Utc::now());
        updated.metadata.insert("skip_reason".to_string(), reason.into());
        self.transition(updated, StepStatus::Skipped).await
    }

    /// Steps still to execute (not completed or skipped), in declared order.
    pub async fn resume_run(&self, run_id: RunId) -> Result<Vec<StepId>, LedgerError> {
        self.run(run_id).await?;
        Ok(self
            .store
            .list_steps(run_id)
            .await?
            .into_iter()
            .filter(|s| !s.status.is_settled())
            .map(|s| s.id)
            .collect())
    }

    /// Failed steps, in declared order.
    pub async fn retry_failed(&self, run_id: RunId) -> Result<Vec<StepId>, LedgerError> {
        self.run(run_id).await?;
        Ok(self
            .store
            .list_steps(run_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.id)
            .collect())
    }

    pub async fn get_status(&self, run_id: RunId) -> Result<RunStatusReport, LedgerError> {
        let run = self.run(run_id).await?;
        let steps = self.store.list_steps(run_id).await?;
        let counts = StepCounts::from_steps(&steps);
        Ok(RunStatusReport { run, steps, counts })
    }

    pub async fn run(&self, run_id: RunId) -> Result<PipelineRun, LedgerError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(LedgerError::RunNotFound(run_id))
    }

    pub async fn step(&self, step_id: StepId) -> Result<PipelineStep, LedgerError> {
        self.store
            .get_step(step_id)
            .await?
            .ok_or(LedgerError::StepNotFound(step_id))
    }

    /// The step of a given type within a run.
    pub async fn find_step(&self, run_id: RunId, step_type: StepType) -> Result<Option<PipelineStep>, LedgerError> {
        Ok(self
            .store
            .list_steps(run_id)
            .await?
            .into_iter()
            .find(|s| s.step_type == step_type))
    }

    pub async fn runs_for_dataset(&self, dataset_id: DatasetId) -> Result<Vec<PipelineRun>, LedgerError> {
        self.store.list_runs(dataset_id).await
    }

    async fn transition(&self, updated: PipelineStep, to: StepStatus) -> Result<PipelineStep, LedgerError> {
        let expected = self.lifecycle.sources_for(to);
        if !self.store.transition_step(&updated, &expected).await? {
            let current = self.step(updated.id).await?;
            warn!(
                step_id = %updated.id,
                status = %current.status,
                target = %to,
                "Step transition rejected"
            );
            return Err(LedgerError::StateConflict {
                step_id: updated.id,
                status: current.status,
            });
        }
        debug!(
            run_id = %updated.run_id,
            step_id = %updated.id,
            step = %updated.step_type,
            status = %to,
            "Step transitioned"
        );
        self.recompute_run(updated.run_id).await?;
        Ok(updated)
    }

    async fn recompute_run(&self, run_id: RunId) -> Result<(), LedgerError> {
        if let Some(run) = self.store.refresh_run_status(run_id).await? {
            info!(run_id = %run_id, dataset_id = run.dataset_id, status = %run.status, "Run status changed");
        }
        Ok(())
    }
}
