//! A single unit of work inside a job.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::warn;

use batchq_core::OperationId;
use batchq_events::{EventBus, Signal};

use crate::types::{OperationExport, OperationStatus};

/// Type-erased async transform shared by every operation of a job.
///
/// Failures are carried as their display text.
pub type Transform<D, R> = Arc<dyn Fn(D) -> BoxFuture<'static, Result<R, String>> + Send + Sync>;

/// Wrap an async function into a [`Transform`].
pub fn transform<D, R, E, F, Fut>(f: F) -> Transform<D, R>
where
    F: Fn(D) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    E: Display,
{
    Arc::new(move |data| {
        let fut = f(data);
        async move { fut.await.map_err(|e| e.to_string()) }.boxed()
    })
}

/// One unit of work: caller data plus its own status and result.
///
/// Operations never retry on their own; a job runs further attempts on the
/// same instance, so `failure_count` accumulates across attempts. Every
/// attempt, whether from [`Operation::start`] or from a job, goes through the
/// same begin, run, settle sequence.
#[derive(Debug, Clone)]
pub struct Operation<D, R> {
    id: OperationId,
    data: D,
    status: OperationStatus,
    result: Option<Result<R, String>>,
    failure_count: u32,
}

impl<D, R> Operation<D, R> {
    pub fn new(id: OperationId, data: D) -> Self {
        Self {
            id,
            data,
            status: OperationStatus::Pending,
            result: None,
            failure_count: 0,
        }
    }

    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Success value or failure reason; set only once the operation settled.
    pub fn result(&self) -> Option<&Result<R, String>> {
        self.result.as_ref()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Move to `Started`, clearing the previous attempt's result, and detach
    /// the attempt so it can run without borrowing the operation.
    ///
    /// Callers must not begin an operation that is already `Started`.
    pub(crate) fn begin(&mut self, transform: &Transform<D, R>) -> Attempt<D, R>
    where
        D: Clone,
    {
        self.status = OperationStatus::Started;
        self.result = None;
        Attempt {
            id: self.id.clone(),
            data: self.data.clone(),
            transform: transform.clone(),
        }
    }

    /// Record the outcome of the running attempt and return the signal to emit.
    pub(crate) fn settle(&mut self, outcome: Result<R, String>) -> Signal {
        let signal = match &outcome {
            Ok(_) => {
                self.status = OperationStatus::Completed;
                Signal::operation_completed(self.id.clone())
            }
            Err(_) => {
                self.failure_count += 1;
                self.status = OperationStatus::Failed;
                Signal::operation_failed(self.id.clone())
            }
        };
        self.result = Some(outcome);
        signal
    }

    /// Run one attempt, publishing started/completed/failed on `bus`.
    ///
    /// Returns `false` without doing anything if an attempt is already running.
    pub async fn start<B>(&mut self, transform: &Transform<D, R>, bus: &B) -> bool
    where
        D: Clone,
        B: EventBus<Signal>,
    {
        if self.status == OperationStatus::Started {
            return false;
        }
        let id = self.id.clone();
        let publish = |signal: Signal| {
            if let Err(e) = bus.publish(signal) {
                warn!(operation = %id, error = ?e, "failed to publish signal");
            }
        };

        let outcome = self.begin(transform).run(&publish).await;
        let signal = self.settle(outcome);
        publish(signal);
        true
    }

    /// Snapshot of the operation; valid at any point in its lifecycle.
    pub fn export(&self) -> OperationExport
    where
        D: Serialize,
        R: Serialize,
    {
        let result = self.result.as_ref().map(|r| match r {
            Ok(value) => serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            Err(reason) => serde_json::Value::String(reason.clone()),
        });

        OperationExport {
            id: self.id.clone(),
            data: serde_json::to_value(&self.data).unwrap_or(serde_json::Value::Null),
            status: self.status,
            result,
            failure_count: self.failure_count,
        }
    }
}

/// A single in-progress attempt of an operation.
pub(crate) struct Attempt<D, R> {
    id: OperationId,
    data: D,
    transform: Transform<D, R>,
}

impl<D, R> Attempt<D, R> {
    /// Announce the attempt through `publish`, then run the transform.
    pub(crate) async fn run<P>(self, publish: P) -> Result<R, String>
    where
        P: Fn(Signal),
    {
        publish(Signal::operation_started(self.id));
        (self.transform)(self.data).await
    }
}
