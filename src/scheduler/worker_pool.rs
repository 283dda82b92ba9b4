//! In-process worker pool for long-running pipeline steps.
//!
//! Callers submit a job and immediately get a [`TaskHandle`] they can poll
//! or await. Jobs are pulled from a shared queue by a fixed set of workers,
//! each job runs in its own task so a panic is reported as that job's
//! failure and does not take the worker down.
//!
//! # Features
//!
//! - Configurable number of workers and queue capacity
//! - Graceful shutdown with broadcast channel
//! - Per-job timeout
//! - Pool statistics tracking

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The job returned an error, panicked or timed out.
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// The job was dropped before it produced a result.
    #[error("Job was cancelled before completion")]
    Cancelled,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Jobs that may wait in the queue before `submit` waits for room.
    pub queue_capacity: usize,
    /// Maximum time allowed for a single job.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_capacity: 256,
            job_timeout: Duration::from_secs(1800), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of jobs completed successfully.
    pub jobs_completed: u64,
    /// Total number of jobs that failed.
    pub jobs_failed: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        let active = self.active_workers.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_workers(active as usize);
    }

    fn decrement_active(&self) {
        let active = self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_workers(active as usize);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Work submitted to the pool.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<JsonValue, String>> + Send + 'static>>;

/// Observable state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Finished,
}

/// Pollable handle to a submitted job.
pub struct TaskHandle {
    id: Uuid,
    label: String,
    status_rx: watch::Receiver<TaskStatus>,
    result_rx: oneshot::Receiver<Result<JsonValue, String>>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> TaskStatus {
        *self.status_rx.borrow()
    }

    /// Waits for the job's result.
    pub async fn wait(self) -> Result<JsonValue, PoolError> {
        match self.result_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(PoolError::JobFailed(message)),
            Err(_) => Err(PoolError::Cancelled),
        }
    }
}

struct QueuedJob {
    id: Uuid,
    label: String,
    future: JobFuture,
    status_tx: watch::Sender<TaskStatus>,
    result_tx: oneshot::Sender<Result<JsonValue, String>>,
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<QueuedJob>>>;

/// Fixed-size pool of workers over an in-process queue.
pub struct StepWorkerPool {
    config: WorkerPoolConfig,
    job_tx: mpsc::Sender<QueuedJob>,
    job_rx: SharedReceiver,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: StdMutex<Vec<JoinHandle<()>>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl StepWorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity.max(1));
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            shutdown_tx,
            worker_handles: StdMutex::new(Vec::new()),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&self) -> Result<(), PoolError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        let mut handles = self.worker_handles.lock().unwrap_or_else(|p| p.into_inner());
        for i in 0..self.config.num_workers.max(1) {
            let worker = Worker {
                id: format!("worker-{}", i),
                jobs: Arc::clone(&self.job_rx),
                shutdown_rx: self.shutdown_tx.subscribe(),
                job_timeout: self.config.job_timeout,
                stats: Arc::clone(&self.stats),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        info!(num_workers = self.config.num_workers, "Worker pool started");
        Ok(())
    }

    /// Queues a job and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotRunning` if the pool has not been started or
    /// has been shut down.
    pub async fn submit<F>(&self, label: impl Into<String>, job: F) -> Result<TaskHandle, PoolError>
    where
        F: Future<Output = Result<JsonValue, String>> + Send + 'static,
    {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        let id = Uuid::new_v4();
        let label = label.into();
        let (status_tx, status_rx) = watch::channel(TaskStatus::Pending);
        let (result_tx, result_rx) = oneshot::channel();

        self.job_tx
            .send(QueuedJob {
                id,
                label: label.clone(),
                future: Box::pin(job),
                status_tx,
                result_tx,
            })
            .await
            .map_err(|_| PoolError::NotRunning)?;

        debug!(job_id = %id, label = %label, "Job submitted");
        Ok(TaskHandle {
            id,
            label,
            status_rx,
            result_rx,
        })
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the job they are running; jobs still queued are
    /// dropped and their handles resolve to `PoolError::Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self
            .worker_handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();

        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await {
            Ok(()) => {
                // Drop whatever is still queued so pending handles resolve.
                let mut rx = self.job_rx.lock().await;
                while rx.try_recv().is_ok() {}
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker pulling jobs from the shared queue.
struct Worker {
    id: String,
    jobs: SharedReceiver,
    shutdown_rx: broadcast::Receiver<()>,
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            let next = {
                let jobs = Arc::clone(&self.jobs);
                tokio::select! {
                    biased;
                    _ = self.shutdown_rx.recv() => None,
                    job = async move { jobs.lock().await.recv().await } => job,
                }
            };
            match next {
                Some(job) => self.process_job(job).await,
                None => break,
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_job(&self, job: QueuedJob) {
        let QueuedJob {
            id,
            label,
            future,
            status_tx,
            result_tx,
        } = job;
        let start_time = Instant::now();

        info!(worker_id = %self.id, job_id = %id, label = %label, "Processing job");
        self.stats.increment_active();
        let _ = status_tx.send(TaskStatus::Running);

        let outcome = match tokio::time::timeout(self.job_timeout, tokio::spawn(future)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) if e.is_panic() => Err("job panicked".to_string()),
            Ok(Err(e)) => Err(format!("job aborted: {}", e)),
            Err(_) => Err(format!("job timed out after {:?}", self.job_timeout)),
        };
        let duration = start_time.elapsed();
        self.stats.decrement_active();

        match &outcome {
            Ok(_) => {
                self.stats.record_completion(duration);
                info!(
                    worker_id = %self.id,
                    job_id = %id,
                    duration_ms = duration.as_millis() as u64,
                    "Job completed successfully"
                );
            }
            Err(e) => {
                self.stats.record_failure(duration);
                warn!(worker_id = %self.id, job_id = %id, error = %e, "Job failed");
            }
        }

        let _ = status_tx.send(TaskStatus::Finished);
        // The caller may have dropped its handle.
        let _ = result_tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_queue_capacity(16)
            .with_job_timeout(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_completion(Duration::from_secs(10));
        stats.record_completion(Duration::from_secs(20));
        stats.record_failure(Duration::from_secs(5));

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
        assert!((pool_stats.success_rate() - 200.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_submit_requires_running_pool() {
        let pool = StepWorkerPool::new(WorkerPoolConfig::new(1));
        let result = pool.submit("noop", async { Ok(json!(null)) }).await;
        assert!(matches!(result, Err(PoolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_jobs_run_and_report() {
        let pool = StepWorkerPool::new(WorkerPoolConfig::new(2));
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyRunning)));

        let ok = pool.submit("ok", async { Ok(json!({"rows": 3})) }).await.unwrap();
        let failing = pool
            .submit("failing", async { Err("boom".to_string()) })
            .await
            .unwrap();

        assert_eq!(ok.wait().await.unwrap(), json!({"rows": 3}));
        assert!(matches!(failing.wait().await, Err(PoolError::JobFailed(m)) if m == "boom"));

        let stats = pool.stats();
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_failed, 1);
        pool.shutdown().await.unwrap();
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_panicking_job_is_a_failure() {
        let pool = StepWorkerPool::new(WorkerPoolConfig::new(1));
        pool.start().unwrap();

        let handle = pool
            .submit("panics", async { panic!("bad job") })
            .await
            .unwrap();
        assert!(matches!(handle.wait().await, Err(PoolError::JobFailed(m)) if m == "job panicked"));

        // The worker survives and keeps serving.
        let next = pool.submit("after", async { Ok(json!(1)) }).await.unwrap();
        assert_eq!(next.wait().await.unwrap(), json!(1));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_status_transitions() {
        let pool = StepWorkerPool::new(WorkerPoolConfig::new(1));
        pool.start().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let handle = pool
            .submit("gated", async move {
                let _ = release_rx.await;
                Ok(json!("done"))
            })
            .await
            .unwrap();

        for _ in 0..100 {
            if handle.status() == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.status(), TaskStatus::Running);

        release_tx.send(()).unwrap();
        assert_eq!(handle.wait().await.unwrap(), json!("done"));
        pool.shutdown().await.unwrap();
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning.to_string().contains("already running"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60)).to_string().contains("60"));
        assert!(PoolError::JobFailed("test error".into()).to_string().contains("test error"));
    }
}
