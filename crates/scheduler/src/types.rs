//! Statuses, job configuration and exported snapshots.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchq_core::{DomainError, DomainResult, JobName, OperationId};

/// Operation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Not attempted yet
    Pending,
    /// Transform invoked, not settled
    Started,
    /// Transform succeeded
    Completed,
    /// Last attempt failed (may still be retried by its job)
    Failed,
}

impl OperationStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Started => write!(f, "started"),
            OperationStatus::Completed => write!(f, "completed"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Job lifecycle status. A job has no failed state: it always completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Started,
    Completed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Started => write!(f, "started"),
            JobStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Dispatch and retry configuration for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Maximum operations in flight at once (>= 1)
    pub concurrency_limit: usize,
    /// Total attempts allowed per operation, first run included (>= 1)
    pub max_failures_per_operation: u32,
    /// One-time delay before the first dispatch
    pub cooldown: Duration,
    /// Retry backoff unit, multiplied by the operation's failure count
    pub throttle: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            max_failures_per_operation: 1,
            cooldown: Duration::ZERO,
            throttle: Duration::from_millis(500),
        }
    }
}

impl JobConfig {
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_max_failures_per_operation(mut self, max: u32) -> Self {
        self.max_failures_per_operation = max;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.concurrency_limit == 0 {
            return Err(DomainError::validation("concurrency_limit must be at least 1"));
        }
        if self.max_failures_per_operation == 0 {
            return Err(DomainError::validation(
                "max_failures_per_operation must be at least 1",
            ));
        }
        Ok(())
    }

    /// Delay before an attempt of an operation that has failed `failure_count` times.
    pub fn retry_delay(&self, failure_count: u32) -> Duration {
        self.throttle.saturating_mul(failure_count)
    }

    /// Whether an operation with `failure_count` failures goes back to the backlog.
    pub fn should_retry(&self, failure_count: u32) -> bool {
        failure_count < self.max_failures_per_operation
    }
}

/// Serializable snapshot of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationExport {
    pub id: OperationId,
    pub data: serde_json::Value,
    pub status: OperationStatus,
    /// Success value or failure reason; `None` until the operation settles.
    pub result: Option<serde_json::Value>,
    pub failure_count: u32,
}

/// Serializable snapshot of a job, live or finished.
///
/// This is also the document persisted for completed jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExport {
    pub name: JobName,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub effective_time_per_operation_ms: Option<u64>,
    pub estimated_time_remaining_ms: Option<u64>,
    pub operations_completed_count: usize,
    /// Every operation, in input order
    pub operations: Vec<OperationExport>,
}

impl JobExport {
    /// Fraction (0.0-1.0) of operations that reached a terminal state.
    pub fn progress(&self) -> f64 {
        if self.operations.is_empty() {
            return if self.status == JobStatus::Completed { 1.0 } else { 0.0 };
        }
        self.operations_completed_count as f64 / self.operations.len() as f64
    }

    pub fn operation(&self, id: &OperationId) -> Option<&OperationExport> {
        self.operations.iter().find(|op| &op.id == id)
    }

    pub fn failed_operations(&self) -> impl Iterator<Item = &OperationExport> {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
    }
}
