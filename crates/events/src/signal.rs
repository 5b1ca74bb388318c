//! Typed lifecycle signals emitted by jobs and operations.

use serde::{Deserialize, Serialize};

use batchq_core::{JobName, OperationId};

/// A lifecycle signal.
///
/// Job-level signals always carry the job name. Operation-level signals carry
/// `job: None` on a job's own bus; a queue fills the name in when it forwards
/// them, so observers of the queue can tell jobs apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    JobStarted {
        job: JobName,
    },
    JobCompleted {
        job: JobName,
    },
    OperationStarted {
        operation: OperationId,
        job: Option<JobName>,
    },
    OperationCompleted {
        operation: OperationId,
        job: Option<JobName>,
    },
    OperationFailed {
        operation: OperationId,
        job: Option<JobName>,
    },
}

impl Signal {
    pub fn operation_started(operation: OperationId) -> Self {
        Self::OperationStarted {
            operation,
            job: None,
        }
    }

    pub fn operation_completed(operation: OperationId) -> Self {
        Self::OperationCompleted {
            operation,
            job: None,
        }
    }

    pub fn operation_failed(operation: OperationId) -> Self {
        Self::OperationFailed {
            operation,
            job: None,
        }
    }

    /// Stable signal name, useful as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::JobStarted { .. } => "job-started",
            Signal::JobCompleted { .. } => "job-completed",
            Signal::OperationStarted { .. } => "operation-started",
            Signal::OperationCompleted { .. } => "operation-completed",
            Signal::OperationFailed { .. } => "operation-failed",
        }
    }

    pub fn job(&self) -> Option<&JobName> {
        match self {
            Signal::JobStarted { job } | Signal::JobCompleted { job } => Some(job),
            Signal::OperationStarted { job, .. }
            | Signal::OperationCompleted { job, .. }
            | Signal::OperationFailed { job, .. } => job.as_ref(),
        }
    }

    pub fn operation(&self) -> Option<&OperationId> {
        match self {
            Signal::JobStarted { .. } | Signal::JobCompleted { .. } => None,
            Signal::OperationStarted { operation, .. }
            | Signal::OperationCompleted { operation, .. }
            | Signal::OperationFailed { operation, .. } => Some(operation),
        }
    }

    /// Attach a job name to an operation-level signal that has none yet.
    pub fn with_job(self, name: &JobName) -> Self {
        match self {
            Signal::OperationStarted {
                operation,
                job: None,
            } => Signal::OperationStarted {
                operation,
                job: Some(name.clone()),
            },
            Signal::OperationCompleted {
                operation,
                job: None,
            } => Signal::OperationCompleted {
                operation,
                job: Some(name.clone()),
            },
            Signal::OperationFailed {
                operation,
                job: None,
            } => Signal::OperationFailed {
                operation,
                job: Some(name.clone()),
            },
            other => other,
        }
    }
}
