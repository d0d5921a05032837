//! Persistence port for job instances, executions, statuses and checkpoints.
//!
//! The engine persists every status transition through this trait before it
//! moves on, so a crash always leaves a resumable, queryable record. The
//! infrastructure layer (batchflow-infra) implements it with SQLite;
//! [`InMemoryPersistence`](super::memory::InMemoryPersistence) backs tests and
//! embedded use.

use async_trait::async_trait;
use batchflow_types::error::RepositoryError;
use batchflow_types::execution::{
    CheckpointDataKey, ChunkCommit, JobExecution, JobInstance, JobStatus, Properties,
    StepExecution, StepStatus, TimestampKind,
};
use batchflow_types::status::BatchStatus;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Storage interface used by the kernel and every controller.
///
/// Covers four entity families:
/// - **Instances:** immutable job identities, including partition and
///   flow-in-split sub-job instances (which carry a parent id and are hidden
///   from the listing queries).
/// - **Executions:** job and step execution history plus point queries.
/// - **Status:** the mutable JobStatus / StepStatus "current state" records.
/// - **Checkpoints:** reader/writer positions by composite key.
#[async_trait]
pub trait PersistenceService: Send + Sync {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Create a job instance with a freshly generated id.
    async fn create_job_instance(
        &self,
        job_name: &str,
        tag: &str,
        descriptor: &str,
        parent_instance_id: Option<i64>,
    ) -> Result<JobInstance, RepositoryError>;

    async fn get_job_instance(&self, instance_id: i64)
    -> Result<Option<JobInstance>, RepositoryError>;

    /// Sub-job instances of `parent_instance_id` named `job_name`.
    async fn find_sub_job_instances(
        &self,
        parent_instance_id: i64,
        job_name: &str,
    ) -> Result<Vec<JobInstance>, RepositoryError>;

    /// Top-level instances of a job, newest first, optionally limited to a tag.
    async fn get_job_instances(
        &self,
        job_name: &str,
        tag: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>, RepositoryError>;

    async fn count_job_instances(
        &self,
        job_name: &str,
        tag: Option<&str>,
    ) -> Result<u64, RepositoryError>;

    /// Distinct names of top-level instances, sorted.
    async fn get_job_names(&self, tag: Option<&str>) -> Result<Vec<String>, RepositoryError>;

    // -----------------------------------------------------------------------
    // Job executions
    // -----------------------------------------------------------------------

    /// Create an execution in STARTING status.
    async fn create_job_execution(
        &self,
        instance_id: i64,
        parameters: &Properties,
    ) -> Result<JobExecution, RepositoryError>;

    async fn get_job_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<JobExecution>, RepositoryError>;

    /// All executions of an instance, oldest first.
    async fn get_job_executions(
        &self,
        instance_id: i64,
    ) -> Result<Vec<JobExecution>, RepositoryError>;

    async fn most_recent_execution_id(
        &self,
        instance_id: i64,
    ) -> Result<Option<i64>, RepositoryError>;

    /// Ids of top-level executions of `job_name` still STARTING/STARTED/STOPPING.
    async fn get_running_execution_ids(&self, job_name: &str)
    -> Result<Vec<i64>, RepositoryError>;

    /// Update the batch status and last-updated time only.
    async fn update_batch_status(
        &self,
        execution_id: i64,
        status: BatchStatus,
    ) -> Result<(), RepositoryError>;

    /// Move a STARTING or STARTED execution, and its instance's JobStatus, to
    /// STOPPING in one step. Returns `false` and writes nothing when the
    /// execution already left those statuses.
    async fn mark_execution_stopping(&self, execution_id: i64) -> Result<bool, RepositoryError>;

    /// Mark STARTED and record the start time.
    async fn mark_execution_started(&self, execution_id: i64) -> Result<(), RepositoryError>;

    /// Record the terminal status, exit status and end time.
    async fn update_execution_final(
        &self,
        execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
    ) -> Result<(), RepositoryError>;

    // -----------------------------------------------------------------------
    // Point queries
    // -----------------------------------------------------------------------

    /// Fails with [`RepositoryError::NotFound`] for unknown executions.
    async fn get_batch_status(&self, execution_id: i64) -> Result<BatchStatus, RepositoryError>;

    async fn get_exit_status(&self, execution_id: i64) -> Result<Option<String>, RepositoryError>;

    async fn get_timestamp(
        &self,
        execution_id: i64,
        kind: TimestampKind,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError>;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Create a step execution in STARTING status.
    async fn create_step_execution(
        &self,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepExecution, RepositoryError>;

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError>;

    async fn get_step_execution(
        &self,
        step_execution_id: i64,
    ) -> Result<Option<StepExecution>, RepositoryError>;

    /// Step executions of one job execution, in creation order.
    async fn get_step_executions(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepExecution>, RepositoryError>;

    /// Persist one chunk boundary atomically: step execution metrics, step
    /// status (committed metrics and user data) and both checkpoints.
    async fn commit_chunk(&self, commit: &ChunkCommit) -> Result<(), RepositoryError>;

    // -----------------------------------------------------------------------
    // Status records
    // -----------------------------------------------------------------------

    async fn save_job_status(&self, status: &JobStatus) -> Result<(), RepositoryError>;

    async fn get_job_status(&self, instance_id: i64) -> Result<Option<JobStatus>, RepositoryError>;

    async fn save_step_status(&self, status: &StepStatus) -> Result<(), RepositoryError>;

    async fn get_step_status(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<Option<StepStatus>, RepositoryError>;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn get_checkpoint(
        &self,
        key: &CheckpointDataKey,
    ) -> Result<Option<Value>, RepositoryError>;

    async fn set_checkpoint(
        &self,
        key: &CheckpointDataKey,
        value: &Value,
    ) -> Result<(), RepositoryError>;

    /// Remove reader and writer checkpoints of one step.
    async fn delete_checkpoints(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<(), RepositoryError>;

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    /// Delete every instance carrying `tag` (with its sub-jobs) and all data
    /// hanging off them. Returns the number of top-level instances removed.
    async fn purge(&self, tag: &str) -> Result<u64, RepositoryError>;
}
