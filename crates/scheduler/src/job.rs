//! Bounded-concurrency dispatch of a job's operations.
//!
//! A job is driven by a single task (the future returned by [`Job::start`]).
//! That task runs an explicit work loop:
//!
//! 1. `tick` admits backlog operations until the concurrency limit is reached,
//!    or completes the job once backlog and in-flight set are both empty.
//! 2. The loop waits for the next in-flight attempt to settle.
//! 3. `settle` records the outcome, requeues or finalizes the operation, and
//!    the loop ticks again.
//!
//! State lives behind a mutex so exports can be taken from anywhere while the
//! job runs. The guard is never held across an `.await`, and signals are
//! published only after it is released.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use batchq_core::{DomainResult, JobName, OperationId};
use batchq_events::{EventBus, InMemoryEventBus, Signal, Subscription};

use crate::operation::{Operation, Transform, transform};
use crate::types::{JobConfig, JobExport, JobStatus, OperationExport, OperationStatus};

/// Signal relay attached by whoever runs a job (see [`Schedulable`]).
pub type SignalRelay = Box<dyn Fn(Signal) -> bool + Send + Sync>;

/// A named batch of operations sharing one transform and one retry policy.
///
/// Cheap to clone; clones share state.
pub struct Job<D, R> {
    inner: Arc<JobInner<D, R>>,
}

struct JobInner<D, R> {
    name: JobName,
    config: JobConfig,
    transform: Transform<D, R>,
    bus: InMemoryEventBus<Signal>,
    state: Mutex<JobState<D, R>>,
}

struct JobState<D, R> {
    status: JobStatus,
    /// Every operation, in input order. The lists below hold indices into it.
    operations: Vec<Operation<D, R>>,
    by_id: HashMap<OperationId, usize>,
    backlog: VecDeque<usize>,
    in_flight: BTreeSet<usize>,
    completed: Vec<usize>,
    start_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    effective_time_per_operation: Option<Duration>,
    estimated_time_remaining: Option<Duration>,
}

impl<D, R> JobState<D, R> {
    fn record_timing(&mut self) {
        let Some(started_at) = self.started_at else {
            return;
        };
        if self.completed.is_empty() {
            return;
        }

        let per_operation = started_at.elapsed() / self.completed.len() as u32;
        let remaining = (self.backlog.len() + self.in_flight.len()) as u32;
        self.effective_time_per_operation = Some(per_operation);
        self.estimated_time_remaining = Some(per_operation * remaining);
    }
}

enum Tick {
    Admit(Vec<Admission>),
    Complete,
}

struct Admission {
    index: usize,
    id: OperationId,
    attempt: u32,
    delay: Duration,
}

enum Disposition {
    Completed,
    Requeued,
    Exhausted,
}

impl<D, R> Clone for Job<D, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, R> JobInner<D, R> {
    fn lock(&self) -> MutexGuard<'_, JobState<D, R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D, R> Job<D, R>
where
    D: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Create a job whose operation ids are the input indices.
    pub fn new<F, Fut, E>(
        name: impl Into<String>,
        data: Vec<D>,
        config: JobConfig,
        f: F,
    ) -> DomainResult<Self>
    where
        F: Fn(D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Display,
    {
        Self::with_ids(name, data, |_, index| OperationId::from(index), config, f)
    }

    /// Create a job deriving each operation id from `(data, index)`.
    ///
    /// Ids should be unique; on collision the last operation wins id lookups.
    pub fn with_ids<I, F, Fut, E>(
        name: impl Into<String>,
        data: Vec<D>,
        id_fn: I,
        config: JobConfig,
        f: F,
    ) -> DomainResult<Self>
    where
        I: Fn(&D, usize) -> OperationId,
        F: Fn(D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Display,
    {
        Self::from_transform(name, data, id_fn, config, transform(f))
    }

    pub fn from_transform<I>(
        name: impl Into<String>,
        data: Vec<D>,
        id_fn: I,
        config: JobConfig,
        transform: Transform<D, R>,
    ) -> DomainResult<Self>
    where
        I: Fn(&D, usize) -> OperationId,
    {
        let name = JobName::parse(name)?;
        config.validate()?;

        let operations: Vec<Operation<D, R>> = data
            .into_iter()
            .enumerate()
            .map(|(index, d)| Operation::new(id_fn(&d, index), d))
            .collect();
        let by_id = operations
            .iter()
            .enumerate()
            .map(|(index, op)| (op.id().clone(), index))
            .collect();
        let backlog = (0..operations.len()).collect();

        Ok(Self {
            inner: Arc::new(JobInner {
                name,
                config,
                transform,
                bus: InMemoryEventBus::new(),
                state: Mutex::new(JobState {
                    status: JobStatus::Pending,
                    operations,
                    by_id,
                    backlog,
                    in_flight: BTreeSet::new(),
                    completed: Vec::new(),
                    start_time: None,
                    started_at: None,
                    effective_time_per_operation: None,
                    estimated_time_remaining: None,
                }),
            }),
        })
    }

    pub fn name(&self) -> &JobName {
        &self.inner.name
    }

    pub fn status(&self) -> JobStatus {
        self.inner.lock().status
    }

    /// Number of operations in the job.
    pub fn len(&self) -> usize {
        self.inner.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Subscribe to this job's signals. Operation signals carry `job: None`.
    pub fn subscribe(&self) -> Subscription<Signal> {
        self.inner.bus.subscribe()
    }

    /// Run the job to completion.
    ///
    /// Only the first call does anything; later calls return immediately,
    /// without waiting for the first run to finish.
    pub async fn start(&self) {
        let total = {
            let mut state = self.inner.lock();
            if state.status != JobStatus::Pending {
                debug!(job = %self.inner.name, status = %state.status, "job already started");
                return;
            }
            state.status = JobStatus::Started;
            state.start_time = Some(Utc::now());
            state.started_at = Some(Instant::now());
            state.operations.len()
        };

        info!(
            job = %self.inner.name,
            operations = total,
            concurrency_limit = self.inner.config.concurrency_limit,
            "job started"
        );
        self.publish(Signal::JobStarted {
            job: self.inner.name.clone(),
        });

        let cooldown = self.inner.config.cooldown;
        if !cooldown.is_zero() {
            debug!(
                job = %self.inner.name,
                cooldown_ms = cooldown.as_millis() as u64,
                "cooling down before first dispatch"
            );
            tokio::time::sleep(cooldown).await;
        }

        let mut in_flight: FuturesUnordered<BoxFuture<'static, (usize, Result<R, String>)>> =
            FuturesUnordered::new();

        loop {
            match self.tick() {
                Tick::Complete => break,
                Tick::Admit(admissions) => {
                    for admission in admissions {
                        in_flight.push(self.attempt(admission));
                    }
                }
            }

            if let Some((index, outcome)) = in_flight.next().await {
                self.settle(index, outcome);
            }
        }

        let (completed, failed) = {
            let state = self.inner.lock();
            let failed = state
                .operations
                .iter()
                .filter(|op| op.status() == OperationStatus::Failed)
                .count();
            (state.completed.len() - failed, failed)
        };
        info!(job = %self.inner.name, completed, failed, "job completed");
        self.publish(Signal::JobCompleted {
            job: self.inner.name.clone(),
        });
    }

    fn tick(&self) -> Tick {
        let mut state = self.inner.lock();

        if state.backlog.is_empty() && state.in_flight.is_empty() {
            state.status = JobStatus::Completed;
            state.record_timing();
            return Tick::Complete;
        }

        let limit = self.inner.config.concurrency_limit;
        let mut admitted = Vec::new();
        while state.in_flight.len() < limit {
            let Some(index) = state.backlog.pop_front() else {
                break;
            };
            state.in_flight.insert(index);

            let op = &state.operations[index];
            admitted.push(Admission {
                index,
                id: op.id().clone(),
                attempt: op.failure_count() + 1,
                delay: self.inner.config.retry_delay(op.failure_count()),
            });
        }

        Tick::Admit(admitted)
    }

    fn attempt(&self, admission: Admission) -> BoxFuture<'static, (usize, Result<R, String>)> {
        let job = self.clone();

        async move {
            debug!(
                job = %job.inner.name,
                operation = %admission.id,
                attempt = admission.attempt,
                delay_ms = admission.delay.as_millis() as u64,
                "operation admitted"
            );
            if !admission.delay.is_zero() {
                tokio::time::sleep(admission.delay).await;
            }

            let attempt = {
                let mut state = job.inner.lock();
                let op = &mut state.operations[admission.index];
                debug_assert_ne!(op.status(), OperationStatus::Started);
                op.begin(&job.inner.transform)
            };

            let outcome = attempt.run(|signal| job.publish(signal)).await;
            (admission.index, outcome)
        }
        .boxed()
    }

    fn settle(&self, index: usize, outcome: Result<R, String>) {
        let config = &self.inner.config;

        let (signal, id, failures, reason, disposition) = {
            let mut state = self.inner.lock();
            state.in_flight.remove(&index);

            let op = &mut state.operations[index];
            let signal = op.settle(outcome);
            let id = op.id().clone();
            let failures = op.failure_count();
            let status = op.status();
            let reason = match op.result() {
                Some(Err(reason)) => Some(reason.clone()),
                _ => None,
            };

            let disposition = match status {
                OperationStatus::Failed if config.should_retry(failures) => {
                    state.backlog.push_back(index);
                    Disposition::Requeued
                }
                OperationStatus::Failed => {
                    state.completed.push(index);
                    state.record_timing();
                    Disposition::Exhausted
                }
                _ => {
                    state.completed.push(index);
                    state.record_timing();
                    Disposition::Completed
                }
            };

            (signal, id, failures, reason, disposition)
        };

        self.publish(signal);

        let error = reason.unwrap_or_default();
        match disposition {
            Disposition::Completed => {
                debug!(job = %self.inner.name, operation = %id, "operation completed");
            }
            Disposition::Requeued => {
                debug!(
                    job = %self.inner.name,
                    operation = %id,
                    failures,
                    retry_in_ms = config.retry_delay(failures).as_millis() as u64,
                    error = %error,
                    "operation failed; requeued"
                );
            }
            Disposition::Exhausted => {
                warn!(
                    job = %self.inner.name,
                    operation = %id,
                    failures,
                    error = %error,
                    "operation failed permanently"
                );
            }
        }
    }

    fn publish(&self, signal: Signal) {
        if let Err(e) = self.inner.bus.publish(signal) {
            warn!(job = %self.inner.name, error = ?e, "failed to publish signal");
        }
    }
}

impl<D, R> Job<D, R>
where
    D: Clone + Serialize + Send + 'static,
    R: Serialize + Send + 'static,
{
    /// Snapshot of the job; reflects live progress while it runs.
    pub fn export(&self) -> JobExport {
        let state = self.inner.lock();

        JobExport {
            name: self.inner.name.clone(),
            status: state.status,
            start_time: state.start_time,
            effective_time_per_operation_ms: state
                .effective_time_per_operation
                .map(|d| d.as_millis() as u64),
            estimated_time_remaining_ms: state.estimated_time_remaining.map(|d| d.as_millis() as u64),
            operations_completed_count: state.completed.len(),
            operations: state.operations.iter().map(Operation::export).collect(),
        }
    }

    /// Snapshot of a single operation by id.
    pub fn operation(&self, id: &OperationId) -> Option<OperationExport> {
        let state = self.inner.lock();
        state
            .by_id
            .get(id)
            .map(|&index| state.operations[index].export())
    }
}

impl<D, R> std::fmt::Debug for Job<D, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Job")
            .field("name", &self.inner.name)
            .field("status", &state.status)
            .field("operations", &state.operations.len())
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

/// A job as seen by a queue: type-erased over its data and result types.
pub trait Schedulable: Send + Sync {
    fn name(&self) -> &JobName;

    fn status(&self) -> JobStatus;

    fn export(&self) -> JobExport;

    /// Forward every signal of the job through `relay`.
    fn relay_signals(&self, relay: SignalRelay);

    /// Run the job to completion (see [`Job::start`]).
    fn run(&self) -> BoxFuture<'static, ()>;
}

impl<D, R> Schedulable for Job<D, R>
where
    D: Clone + Serialize + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn name(&self) -> &JobName {
        &self.inner.name
    }

    fn status(&self) -> JobStatus {
        self.inner.lock().status
    }

    fn export(&self) -> JobExport {
        Job::export(self)
    }

    fn relay_signals(&self, relay: SignalRelay) {
        self.inner.bus.relay(relay);
    }

    fn run(&self) -> BoxFuture<'static, ()> {
        let job = self.clone();
        async move { job.start().await }.boxed()
    }
}
