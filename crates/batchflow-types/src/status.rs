//! Batch and extended status vocabulary.
//!
//! `BatchStatus` is the persisted status of jobs and steps. Its string form
//! (`STARTING`, `STARTED`, ...) is part of the interop contract and must not
//! change. `ExtendedBatchStatus` is engine-internal: it drives transition
//! logic between execution elements and is never persisted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BatchStatus
// ---------------------------------------------------------------------------

/// Persisted status of a job execution, step execution, job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    /// The canonical upper-case name (`"COMPLETED"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }

    /// Whether an execution in this status has finished running.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Completed
                | BatchStatus::Abandoned
        )
    }

    /// Whether an execution in this status is (or is about to be) running.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown batch status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for BatchStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ExtendedBatchStatus / ExecutionStatus
// ---------------------------------------------------------------------------

/// Transient outcome of one execution element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtendedBatchStatus {
    /// The element ran and finished without an escaping error.
    NormalCompletion,
    /// The element's body failed.
    ExceptionThrown,
    /// The element was skipped (completed step, restart not allowed).
    DoNotRun,
    /// An operator stop was observed before the element could run.
    JobOperatorStopping,
    /// An `end` transition terminated the job.
    JslEnd,
    /// A `fail` transition terminated the job.
    JslFail,
    /// A `stop` transition terminated the job.
    JslStop,
}

impl ExtendedBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtendedBatchStatus::NormalCompletion => "NORMAL_COMPLETION",
            ExtendedBatchStatus::ExceptionThrown => "EXCEPTION_THROWN",
            ExtendedBatchStatus::DoNotRun => "DO_NOT_RUN",
            ExtendedBatchStatus::JobOperatorStopping => "JOB_OPERATOR_STOPPING",
            ExtendedBatchStatus::JslEnd => "JSL_END",
            ExtendedBatchStatus::JslFail => "JSL_FAIL",
            ExtendedBatchStatus::JslStop => "JSL_STOP",
        }
    }
}

impl fmt::Display for ExtendedBatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one execution element: extended status plus exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStatus {
    pub extended: ExtendedBatchStatus,
    pub exit_status: Option<String>,
    /// Element id a `stop` transition asked the next restart to begin from.
    pub restart_on: Option<String>,
}

impl ExecutionStatus {
    pub fn new(extended: ExtendedBatchStatus, exit_status: Option<String>) -> Self {
        Self {
            extended,
            exit_status,
            restart_on: None,
        }
    }

    pub fn normal(exit_status: Option<String>) -> Self {
        Self::new(ExtendedBatchStatus::NormalCompletion, exit_status)
    }

    pub fn exception(exit_status: Option<String>) -> Self {
        Self::new(ExtendedBatchStatus::ExceptionThrown, exit_status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
