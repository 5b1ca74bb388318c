//! Sequential runner for jobs.
//!
//! A queue runs at most one job at a time, in submission order. Each
//! completion promotes the next backlog entry on a fresh task, so a long run
//! of jobs never grows the stack.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use batchq_core::JobName;
use batchq_events::{EventBus, InMemoryEventBus, Signal, Subscription};

use crate::job::Schedulable;
use crate::store::{DirectoryStore, ExportStore, StoreError};
use crate::types::{JobExport, JobStatus};

/// Environment variable naming the persistence directory.
pub const PERSIST_DIR_ENV: &str = "BATCHQ_PERSIST_DIR";

/// Queue configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Where exports of completed jobs are written; `None` disables persistence.
    pub persistence_dir: Option<PathBuf>,
}

impl QueueConfig {
    pub fn with_persistence_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistence_dir = Some(dir.into());
        self
    }

    /// Read configuration from the environment (`BATCHQ_PERSIST_DIR`).
    pub fn from_env() -> Self {
        let persistence_dir = std::env::var_os(PERSIST_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self { persistence_dir }
    }
}

/// Queue error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("persisted jobs were requested but no persistence is configured")]
    PersistenceNotConfigured,
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job already submitted: {0}")]
    DuplicateJob(JobName),
    #[error("job {0} was already started outside the queue")]
    AlreadyStarted(JobName),
    #[error("no tokio runtime available to run jobs")]
    RuntimeUnavailable,
    #[error("job {0} ended without completing")]
    CompletionDropped(JobName),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
}

/// Resolves once, with the job's name, when a submitted job completes.
///
/// Fails with [`QueueError::CompletionDropped`] if the job's task panicked.
#[derive(Debug)]
pub struct JobCompletion {
    name: JobName,
    rx: oneshot::Receiver<JobName>,
}

impl JobCompletion {
    pub fn name(&self) -> &JobName {
        &self.name
    }

    pub async fn wait(self) -> Result<JobName, QueueError> {
        self.rx
            .await
            .map_err(|_| QueueError::CompletionDropped(self.name))
    }
}

type SharedJob = Arc<dyn Schedulable>;

/// Runs submitted jobs one at a time and re-emits all their signals.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    bus: Arc<InMemoryEventBus<Signal>>,
    store: Option<Arc<dyn ExportStore>>,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<SharedJob>,
    current: Option<SharedJob>,
    completed: Vec<JobName>,
    index: HashMap<JobName, SharedJob>,
    /// Submission order of `index`.
    submitted: Vec<JobName>,
    waiters: HashMap<JobName, oneshot::Sender<JobName>>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    /// A queue without persistence.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A queue persisting completed exports into `store`.
    pub fn with_store(store: Arc<dyn ExportStore>) -> Self {
        Self::build(Some(store))
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        match &config.persistence_dir {
            Some(dir) => Self::with_store(Arc::new(DirectoryStore::new(dir.clone()))),
            None => Self::new(),
        }
    }

    fn build(store: Option<Arc<dyn ExportStore>>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                bus: Arc::new(InMemoryEventBus::new()),
                store,
            }),
        }
    }

    /// Subscribe to the signals of every job this queue runs.
    ///
    /// Operation signals arrive tagged with their job's name.
    pub fn subscribe(&self) -> Subscription<Signal> {
        self.inner.bus.subscribe()
    }

    /// Enqueue a job; it starts as soon as every earlier job has completed.
    ///
    /// Only pending jobs are accepted. Must be called from within a Tokio
    /// runtime.
    pub fn submit<J>(&self, job: J) -> Result<JobCompletion, QueueError>
    where
        J: Schedulable + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| QueueError::RuntimeUnavailable)?;
        let job: SharedJob = Arc::new(job);
        let name = job.name().clone();
        if job.status() != JobStatus::Pending {
            return Err(QueueError::AlreadyStarted(name));
        }
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.inner.lock();
            if state.index.contains_key(&name) {
                return Err(QueueError::DuplicateJob(name));
            }
            state.index.insert(name.clone(), job.clone());
            state.submitted.push(name.clone());
            state.waiters.insert(name.clone(), tx);
            state.backlog.push_back(job);
            debug!(job = %name, backlog = state.backlog.len(), "job queued");
        }

        self.promote(&runtime);
        Ok(JobCompletion { name, rx })
    }

    /// Start the next backlog job if nothing is running.
    fn promote(&self, runtime: &Handle) {
        let job = {
            let mut state = self.inner.lock();
            if state.current.is_some() {
                return;
            }
            let Some(job) = state.backlog.pop_front() else {
                return;
            };
            state.current = Some(job.clone());
            job
        };

        let bus = self.inner.bus.clone();
        let name = job.name().clone();
        job.relay_signals(Box::new(move |signal: Signal| {
            bus.publish(signal.with_job(&name)).is_ok()
        }));

        info!(job = %job.name(), "job promoted");
        let queue = self.clone();
        runtime.spawn(async move {
            // A panicking transform takes down only the inner task.
            let completed = match tokio::spawn(job.run()).await {
                Ok(()) if job.status() == JobStatus::Completed => true,
                Ok(()) => {
                    warn!(job = %job.name(), "job was started outside the queue while queued");
                    false
                }
                Err(e) => {
                    error!(job = %job.name(), error = %e, "job task aborted");
                    false
                }
            };
            queue.finish(job, completed);
        });
    }

    fn finish(&self, job: SharedJob, completed: bool) {
        let name = job.name().clone();

        if completed {
            if let Some(store) = &self.inner.store {
                if let Err(e) = store.save(&job.export()) {
                    warn!(job = %name, error = %e, "failed to persist job export");
                }
            }
        }

        let waiter = {
            let mut state = self.inner.lock();
            state.current = None;
            if completed {
                state.completed.push(name.clone());
            }
            state.waiters.remove(&name)
        };
        // Dropping the sender fails the waiter with `CompletionDropped`.
        if let (true, Some(tx)) = (completed, waiter) {
            let _ = tx.send(name.clone());
        }
        info!(job = %name, completed, "job finished");

        // Called from inside the job's task, so a runtime is present.
        self.promote(&Handle::current());
    }

    /// Name of the running job, if any.
    pub fn current_job(&self) -> Option<JobName> {
        self.inner.lock().current.as_ref().map(|job| job.name().clone())
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            pending: state.backlog.len(),
            running: usize::from(state.current.is_some()),
            completed: state.completed.len(),
        }
    }

    fn store(&self, include_persisted: bool) -> Result<Option<&dyn ExportStore>, QueueError> {
        if !include_persisted {
            return Ok(None);
        }
        match &self.inner.store {
            Some(store) => Ok(Some(store.as_ref())),
            None => Err(QueueError::PersistenceNotConfigured),
        }
    }

    /// Whether a job is known in memory or, optionally, in the store.
    pub fn has_job(&self, name: &str, include_persisted: bool) -> Result<bool, QueueError> {
        let store = self.store(include_persisted)?;
        if self.inner.lock().index.contains_key(name) {
            return Ok(true);
        }
        match store {
            Some(store) => Ok(store.contains(name)?),
            None => Ok(false),
        }
    }

    /// Exports of every known job: in-memory ones in submission order, then
    /// persisted-only ones by name.
    pub fn all_jobs(&self, include_persisted: bool) -> Result<Vec<JobExport>, QueueError> {
        let store = self.store(include_persisted)?;
        let jobs: Vec<SharedJob> = {
            let state = self.inner.lock();
            state
                .submitted
                .iter()
                .filter_map(|name| state.index.get(name).cloned())
                .collect()
        };
        let mut exports: Vec<JobExport> = jobs.iter().map(|job| job.export()).collect();

        if let Some(store) = store {
            for name in store.names()? {
                if exports.iter().any(|e| e.name == name) {
                    continue;
                }
                if let Some(export) = store.load(name.as_str())? {
                    exports.push(export);
                }
            }
        }

        Ok(exports)
    }

    /// Export of one job, looked up in memory first and then in the store.
    pub fn job_export(&self, name: &str, include_persisted: bool) -> Result<JobExport, QueueError> {
        let store = self.store(include_persisted)?;
        let job = self.inner.lock().index.get(name).cloned();
        if let Some(job) = job {
            return Ok(job.export());
        }
        if let Some(store) = store {
            if let Some(export) = store.load(name)? {
                return Ok(export);
            }
        }
        Err(QueueError::JobNotFound(name.to_string()))
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("stats", &self.stats())
            .field("current", &self.current_job())
            .field("persistent", &self.inner.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use batchq_core::OperationId;

    use super::*;
    use crate::job::Job;
    use crate::store::InMemoryStore;
    use crate::types::JobConfig;

    fn sleepy(name: &str, items: Vec<u64>) -> Job<u64, u64> {
        Job::new(name, items, JobConfig::default().with_concurrency_limit(2), |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_one_at_a_time() {
        let queue = Queue::new();
        let mut sub = queue.subscribe();

        let a = queue.submit(sleepy("a", vec![50, 10])).unwrap();
        let b = queue.submit(sleepy("b", vec![5])).unwrap();
        assert_eq!(queue.current_job().map(String::from), Some("a".to_string()));
        assert_eq!(queue.stats().pending, 1);

        assert_eq!(a.wait().await.unwrap().as_str(), "a");
        assert_eq!(b.wait().await.unwrap().as_str(), "b");

        let lifecycle: Vec<(String, &str)> = sub
            .drain()
            .into_iter()
            .filter(|s| s.operation().is_none())
            .map(|s| (s.job().unwrap().to_string(), s.kind()))
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                ("a".to_string(), "job-started"),
                ("a".to_string(), "job-completed"),
                ("b".to_string(), "job-started"),
                ("b".to_string(), "job-completed"),
            ]
        );
        assert_eq!(
            queue.stats(),
            QueueStats {
                pending: 0,
                running: 0,
                completed: 2
            }
        );
        assert!(queue.current_job().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn forwarded_operation_signals_carry_job_name() {
        let queue = Queue::new();
        let mut sub = queue.subscribe();

        queue.submit(sleepy("tagged", vec![1])).unwrap().wait().await.unwrap();

        let ops: Vec<Signal> = sub
            .drain()
            .into_iter()
            .filter(|s| s.operation().is_some())
            .collect();
        let name = JobName::parse("tagged").unwrap();
        assert_eq!(
            ops,
            vec![
                Signal::OperationStarted {
                    operation: OperationId::from(0),
                    job: Some(name.clone())
                },
                Signal::OperationCompleted {
                    operation: OperationId::from(0),
                    job: Some(name)
                },
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let queue = Queue::new();
        queue.submit(sleepy("same", vec![])).unwrap();

        let err = queue.submit(sleepy("same", vec![])).unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob(name) if name.as_str() == "same"));
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_started_elsewhere_are_rejected() {
        let store = InMemoryStore::arc();
        let queue = Queue::with_store(store.clone());

        let slow = sleepy("slow", vec![1000]);
        let runner = slow.clone();
        let running = tokio::spawn(async move { runner.start().await });
        tokio::task::yield_now().await;
        assert_eq!(slow.status(), JobStatus::Started);

        let err = queue.submit(slow.clone()).unwrap_err();
        assert!(matches!(err, QueueError::AlreadyStarted(name) if name.as_str() == "slow"));
        assert!(!queue.has_job("slow", false).unwrap());

        // The queue stays free for other work and never persists the outsider.
        queue.submit(sleepy("other", vec![5])).unwrap().wait().await.unwrap();
        assert_eq!(slow.status(), JobStatus::Started);
        assert!(store.load("slow").unwrap().is_none());

        running.await.unwrap();
        let err = queue.submit(slow).unwrap_err();
        assert!(matches!(err, QueueError::AlreadyStarted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn job_started_while_queued_is_not_reported_complete() {
        let store = InMemoryStore::arc();
        let queue = Queue::with_store(store.clone());

        let first = queue.submit(sleepy("first", vec![100])).unwrap();
        let late = sleepy("late", vec![1000]);
        let waiter = queue.submit(late.clone()).unwrap();

        let runner = late.clone();
        tokio::spawn(async move { runner.start().await });

        first.wait().await.unwrap();
        assert!(matches!(waiter.wait().await, Err(QueueError::CompletionDropped(_))));
        assert!(store.load("late").unwrap().is_none());
        assert_eq!(late.status(), JobStatus::Started);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_releases_the_queue() {
        let store = InMemoryStore::arc();
        let queue = Queue::with_store(store.clone());
        let boom = Job::new("boom", vec![1u64], JobConfig::default(), |n: u64| async move {
            if n == 1 {
                panic!("transform blew up");
            }
            Ok::<_, String>(n)
        })
        .unwrap();

        let failed = queue.submit(boom).unwrap();
        let next = queue.submit(sleepy("next", vec![5])).unwrap();

        assert!(matches!(
            failed.wait().await,
            Err(QueueError::CompletionDropped(name)) if name.as_str() == "boom"
        ));
        assert_eq!(next.wait().await.unwrap().as_str(), "next");

        assert!(store.load("boom").unwrap().is_none());
        assert!(store.load("next").unwrap().is_some());
        assert_eq!(queue.stats().completed, 1);
        assert!(queue.current_job().is_none());
    }

    #[test]
    fn submit_outside_runtime_fails_cleanly() {
        let queue = Queue::new();
        let err = queue.submit(sleepy("x", vec![1])).unwrap_err();
        assert!(matches!(err, QueueError::RuntimeUnavailable));
        assert!(!queue.has_job("x", false).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_lookup_requires_configured_store() {
        let queue = Queue::new();

        assert!(matches!(
            queue.job_export("missing", true),
            Err(QueueError::PersistenceNotConfigured)
        ));
        assert!(matches!(
            queue.has_job("missing", true),
            Err(QueueError::PersistenceNotConfigured)
        ));
        assert!(matches!(
            queue.all_jobs(true),
            Err(QueueError::PersistenceNotConfigured)
        ));
        assert!(matches!(
            queue.job_export("missing", false),
            Err(QueueError::JobNotFound(name)) if name == "missing"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_exports_are_persisted() {
        let store = InMemoryStore::arc();
        let queue = Queue::with_store(store.clone());

        queue.submit(sleepy("saved", vec![3, 4])).unwrap().wait().await.unwrap();

        let persisted = store.load("saved").unwrap().unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);
        assert_eq!(persisted.operations_completed_count, 2);
        assert_eq!(queue.job_export("saved", true).unwrap(), persisted);
    }

    #[tokio::test(start_paused = true)]
    async fn queries_merge_memory_and_store() {
        let store = InMemoryStore::arc();
        let earlier = Queue::with_store(store.clone());
        earlier.submit(sleepy("yesterday", vec![1])).unwrap().wait().await.unwrap();

        // A fresh queue sharing the store only knows "yesterday" through it.
        let queue = Queue::with_store(store);
        queue.submit(sleepy("today", vec![1])).unwrap().wait().await.unwrap();

        assert!(queue.has_job("today", false).unwrap());
        assert!(!queue.has_job("yesterday", false).unwrap());
        assert!(queue.has_job("yesterday", true).unwrap());

        let names: Vec<String> = queue
            .all_jobs(true)
            .unwrap()
            .into_iter()
            .map(|e| e.name.into())
            .collect();
        assert_eq!(names, vec!["today", "yesterday"]);
        assert_eq!(queue.all_jobs(false).unwrap().len(), 1);

        assert_eq!(
            queue.job_export("yesterday", true).unwrap().name.as_str(),
            "yesterday"
        );
        assert!(matches!(
            queue.job_export("tomorrow", true),
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[test]
    fn config_builds_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig::default().with_persistence_dir(dir.path());
        let queue = Queue::from_config(&config);
        assert!(queue.has_job("anything", true).is_ok());

        let queue = Queue::from_config(&QueueConfig::default());
        assert!(matches!(
            queue.has_job("anything", true),
            Err(QueueError::PersistenceNotConfigured)
        ));
    }
}
