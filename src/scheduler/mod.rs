//! Background execution of long-running pipeline steps.
//!
//! - **StepWorkerPool**: fixed set of workers over an in-process queue
//! - **TaskHandle**: pollable handle returned for every submitted job
//!
//! # Example
//!
//! ```rust,ignore
//! use ruleforge::scheduler::{StepWorkerPool, WorkerPoolConfig};
//!
//! let pool = StepWorkerPool::new(WorkerPoolConfig::new(4));
//! pool.start()?;
//!
//! let handle = pool.submit("validate", async { Ok(serde_json::json!({})) }).await?;
//! let report = handle.wait().await?;
//!
//! pool.shutdown().await?;
//! ```

pub mod worker_pool;

pub use worker_pool::{
    JobFuture, PoolError, PoolStats, StepWorkerPool, TaskHandle, TaskStatus, WorkerPoolConfig,
};
