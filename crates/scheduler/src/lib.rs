//! `batchq-scheduler`: bounded-concurrency batch execution.
//!
//! ## Components
//!
//! - [`Operation`]: one unit of work; caller data plus status and result
//! - [`Job`]: a named batch of operations sharing one async transform, run
//!   with a concurrency cap, an optional cooldown and throttled retries
//! - [`Queue`]: runs jobs one at a time, re-emits their signals and
//!   optionally persists the export of each completed job
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use batchq_scheduler::{Job, JobConfig, Queue};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = JobConfig::default()
//!     .with_concurrency_limit(4)
//!     .with_max_failures_per_operation(3)
//!     .with_throttle(Duration::from_millis(200));
//!
//! let job = Job::new("squares", vec![1u64, 2, 3], config, |n: u64| async move {
//!     Ok::<_, String>(n * n)
//! })?;
//!
//! let queue = Queue::new();
//! let done = queue.submit(job)?;
//! done.wait().await?;
//!
//! let export = queue.job_export("squares", false)?;
//! println!("{}", serde_json::to_string_pretty(&export)?);
//! # Ok(())
//! # }
//! ```

pub mod job;
pub mod operation;
pub mod queue;
pub mod store;
pub mod types;

pub use batchq_core::{DomainError, JobName, OperationId};
pub use batchq_events::{Signal, Subscription};
pub use job::{Job, Schedulable, SignalRelay};
pub use operation::{Operation, Transform, transform};
pub use queue::{JobCompletion, PERSIST_DIR_ENV, Queue, QueueConfig, QueueError, QueueStats};
pub use store::{DirectoryStore, ExportStore, InMemoryStore, StoreError};
pub use types::{JobConfig, JobExport, JobStatus, OperationExport, OperationStatus};
