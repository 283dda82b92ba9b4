//! Persistence interface for runs and steps.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::model::{PipelineRun, PipelineStep, RunId, StepId, StepStatus};
use super::LedgerError;
use crate::dataset::DatasetId;

/// Durable storage for the run ledger.
///
/// Every write is expected to be durable when the call returns, so a crash
/// between calls leaves resumable state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts a run together with its initial steps.
    async fn insert_run(&self, run: &PipelineRun, steps: &[PipelineStep]) -> Result<(), LedgerError>;

    async fn get_run(&self, id: RunId) -> Result<Option<PipelineRun>, LedgerError>;

    /// Re-derives a run's status from its stored steps and persists it.
    ///
    /// The read and the write happen atomically with respect to other
    /// refreshes and step transitions of the same run, so concurrent
    /// completions cannot leave a stale status behind. Returns the run when
    /// its status changed; `None` when unchanged or the run does not exist.
    async fn refresh_run_status(&self, run_id: RunId) -> Result<Option<PipelineRun>, LedgerError>;

    /// Runs for a dataset, newest first.
    async fn list_runs(&self, dataset_id: DatasetId) -> Result<Vec<PipelineRun>, LedgerError>;

    async fn get_step(&self, id: StepId) -> Result<Option<PipelineStep>, LedgerError>;

    /// Steps of a run in declared order.
    async fn list_steps(&self, run_id: RunId) -> Result<Vec<PipelineStep>, LedgerError>;

    /// Replaces a step only if its stored status is one of `expected`.
    ///
    /// Returns `false` when the stored status did not match; nothing is
    /// written in that case.
    async fn transition_step(
        &self,
        step: &PipelineStep,
        expected: &[StepStatus],
    ) -> Result<bool, LedgerError>;
}

#[derive(Default)]
struct LedgerState {
    runs: HashMap<RunId, PipelineRun>,
    steps: HashMap<StepId, PipelineStep>,
}

/// In-process ledger store, used by the CLI and tests.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: RwLock<LedgerState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_run(&self, run: &PipelineRun, steps: &[PipelineStep]) -> Result<(), LedgerError> {
        let mut state = self.state.write().await;
        state.runs.insert(run.id, run.clone());
        for step in steps {
            state.steps.insert(step.id, step.clone());
        }
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<PipelineRun>, LedgerError> {
        Ok(self.state.read().await.runs.get(&id).cloned())
    }

    async fn refresh_run_status(&self, run_id: RunId) -> Result<Option<PipelineRun>, LedgerError> {
        let mut state = self.state.write().await;
        let mut steps: Vec<PipelineStep> = state
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_type.position());
        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(None);
        };
        Ok(run.refresh_status(&steps).then(|| run.clone()))
    }

    async fn list_runs(&self, dataset_id: DatasetId) -> Result<Vec<PipelineRun>, LedgerError> {
        let state = self.state.read().await;
        let mut runs: Vec<PipelineRun> = state
            .runs
            .values()
            .filter(|r| r.dataset_id == dataset_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn get_step(&self, id: StepId) -> Result<Option<PipelineStep>, LedgerError> {
        Ok(self.state.read().await.steps.get(&id).cloned())
    }

    async fn list_steps(&self, run_id: RunId) -> Result<Vec<PipelineStep>, LedgerError> {
        let state = self.state.read().await;
        let mut steps: Vec<PipelineStep> = state
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_type.position());
        Ok(steps)
    }

    async fn transition_step(
        &self,
        step: &PipelineStep,
        expected: &[StepStatus],
    ) -> Result<bool, LedgerError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.steps.get_mut(&step.id) else {
            return Err(LedgerError::StepNotFound(step.id));
        };
        if !expected.contains(&stored.status) {
            return Ok(false);
        }
        *stored = step.clone();
        Ok(true)
    }
}
