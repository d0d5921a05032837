//! Persisted execution records.
//!
//! `JobInstance` is the immutable identity of a logical job; `JobExecution`
//! and `StepExecution` are the audit history of attempts to run it;
//! `JobStatus` and `StepStatus` are the mutable "current state" records used
//! to decide restart eligibility; `CheckpointData` holds reader/writer
//! positions keyed by instance, step and stream.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::BatchStatus;

/// Job parameters and artifact properties.
pub type Properties = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Job instance / execution
// ---------------------------------------------------------------------------

/// One logical, nameable job. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: i64,
    pub job_name: String,
    /// Authorization tag of the tenant that created the instance.
    pub tag: String,
    /// Serialized job definition used for restarts.
    pub descriptor: String,
    /// Owning top-level instance for partition and flow-in-split sub-jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<i64>,
}

impl JobInstance {
    /// Sub-jobs are internal and hidden from operator listings.
    pub fn is_sub_job(&self) -> bool {
        self.parent_instance_id.is_some()
    }
}

/// One attempt to run a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: i64,
    pub instance_id: i64,
    pub job_name: String,
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    pub create_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated_time: DateTime<Utc>,
    #[serde(default)]
    pub parameters: Properties,
}

/// Which timestamp of a job execution a point query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampKind {
    Create,
    Start,
    End,
    LastUpdated,
}

// ---------------------------------------------------------------------------
// Step execution / metrics
// ---------------------------------------------------------------------------

/// Item-level counters of a step execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub read_count: u64,
    pub write_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub filter_count: u64,
}

impl StepMetrics {
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

/// One attempt to run a step within a job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_execution_id: i64,
    pub job_execution_id: i64,
    pub step_name: String,
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: StepMetrics,
    /// Opaque user data persisted at checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Current-state records
// ---------------------------------------------------------------------------

/// Durable current state of a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub instance_id: i64,
    pub job_instance: JobInstance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_status: Option<BatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_execution_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Element a `stop` transition asked the next restart to begin from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_on: Option<String>,
}

impl JobStatus {
    pub fn new(job_instance: JobInstance) -> Self {
        Self {
            instance_id: job_instance.instance_id,
            job_instance,
            batch_status: None,
            exit_status: None,
            latest_execution_id: None,
            current_step: None,
            restart_on: None,
        }
    }
}

/// Durable current state of a step within a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub instance_id: i64,
    pub step_name: String,
    /// Most recent step execution of this step.
    pub last_step_execution_id: i64,
    pub batch_status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<String>,
    pub start_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_user_data: Option<Value>,
    /// Metrics as of the last committed checkpoint.
    #[serde(default)]
    pub committed_metrics: StepMetrics,
    /// Number of partitions of the first partitioned run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_count: Option<u32>,
}

impl StepStatus {
    pub fn new(instance_id: i64, step_name: impl Into<String>, step_execution_id: i64) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
            last_step_execution_id: step_execution_id,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            start_count: 1,
            persistent_user_data: None,
            committed_metrics: StepMetrics::default(),
            partition_count: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint data
// ---------------------------------------------------------------------------

/// Stream whose position a checkpoint records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStream {
    Reader,
    Writer,
}

impl CheckpointStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStream::Reader => "reader",
            CheckpointStream::Writer => "writer",
        }
    }
}

/// Composite key of a checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointDataKey {
    pub instance_id: i64,
    pub step_name: String,
    pub stream: CheckpointStream,
}

impl CheckpointDataKey {
    pub fn new(instance_id: i64, step_name: impl Into<String>, stream: CheckpointStream) -> Self {
        Self {
            instance_id,
            step_name: step_name.into(),
            stream,
        }
    }
}

impl fmt::Display for CheckpointDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.instance_id,
            self.step_name,
            self.stream.as_str()
        )
    }
}

/// Everything a chunk commit persists as one atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCommit {
    pub step_execution: StepExecution,
    pub step_status: StepStatus,
    pub reader_checkpoint: Option<(CheckpointDataKey, Value)>,
    pub writer_checkpoint: Option<(CheckpointDataKey, Value)>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
