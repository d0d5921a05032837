//! Engine error type.
//!
//! Every condition the operator API or the controllers can report is a named
//! variant so that callers can tell configuration mistakes and "not running"
//! replies apart from genuine failures.

use batchflow_types::error::{ArtifactError, RepositoryError};
use batchflow_types::status::BatchStatus;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BatchError {
    #[error("tag '{tag}' is not authorized for instance {instance_id}")]
    Security { tag: String, instance_id: i64 },

    #[error("no such job: {0}")]
    NoSuchJob(String),

    #[error("no such job execution: {0}")]
    NoSuchJobExecution(i64),

    #[error("no such job instance: {0}")]
    NoSuchJobInstance(i64),

    #[error("job instance {instance_id} already completed")]
    AlreadyComplete { instance_id: i64 },

    #[error("execution {execution_id} is not the most recent execution of instance {instance_id}")]
    NotMostRecentExecution { execution_id: i64, instance_id: i64 },

    #[error("job execution {0} is not running")]
    NotRunning(i64),

    #[error("job execution {execution_id} is still running ({status})")]
    ExecutionIsRunning {
        execution_id: i64,
        status: BatchStatus,
    },

    #[error("job instance {instance_id} is already executing")]
    AlreadyExecuting { instance_id: i64 },

    #[error("job instance {instance_id} was abandoned")]
    Abandoned { instance_id: i64 },

    #[error("job '{0}' is not restartable")]
    NotRestartable(String),

    #[error("step '{step}' reached its start limit of {limit} (start {attempt})")]
    StartLimitExceeded { step: String, limit: i32, attempt: u32 },

    #[error("step '{step}' has a negative start limit {limit}")]
    NegativeStartLimit { step: String, limit: i32 },

    #[error("decision '{decision}' directly follows decision '{previous}'")]
    DecisionAfterDecision { previous: String, decision: String },

    #[error("invalid job definition: {0}")]
    InvalidDefinition(String),

    #[error("no artifact registered as {kind} '{name}'")]
    ArtifactNotFound { kind: &'static str, name: String },

    #[error("step '{step}' exceeded its skip limit of {limit}: {source}")]
    SkipLimitExceeded {
        step: String,
        limit: u32,
        #[source]
        source: ArtifactError,
    },

    #[error("partitioned step '{step}' timed out after {received} of {expected} partitions reported")]
    PartitionTimeout {
        step: String,
        received: u32,
        expected: u32,
    },

    #[error("partitioned step '{step}' failed: {failed} partition(s) failed")]
    PartitionFailed { step: String, failed: u32 },

    /// A user artifact panicked inside a work unit.
    #[error("work unit panicked: {0}")]
    Panicked(String),

    #[error("internal consistency error: {0}")]
    InternalConsistency(String),

    /// Status bookkeeping itself failed; the job is marked FAILED.
    #[error("fatal error: {0}")]
    Fatal(Box<BatchError>),

    #[error("persistence error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

impl BatchError {
    /// Wrap an error as job-fatal (idempotent).
    pub fn fatal(err: BatchError) -> Self {
        match err {
            BatchError::Fatal(_) => err,
            other => BatchError::Fatal(Box::new(other)),
        }
    }

    /// Build from the payload returned by a caught unwind.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        BatchError::Panicked(message)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BatchError::Fatal(_))
    }

    /// Errors caused by the job definition rather than by a failing run.
    pub fn is_configuration_error(&self) -> bool {
        match self {
            BatchError::NegativeStartLimit { .. }
            | BatchError::StartLimitExceeded { .. }
            | BatchError::DecisionAfterDecision { .. }
            | BatchError::NotRestartable(_)
            | BatchError::AlreadyComplete { .. }
            | BatchError::Abandoned { .. }
            | BatchError::InvalidDefinition(_)
            | BatchError::ArtifactNotFound { .. } => true,
            BatchError::Fatal(inner) => inner.is_configuration_error(),
            _ => false,
        }
    }
}
