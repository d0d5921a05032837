//! In-memory implementation of [`PersistenceService`].
//!
//! All tables live behind one lock so that multi-record writes such as
//! [`PersistenceService::commit_chunk`] are atomic. Useful for tests and for
//! embedding the engine without durable storage.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use batchflow_types::error::RepositoryError;
use batchflow_types::execution::{
    CheckpointDataKey, CheckpointStream, ChunkCommit, JobExecution, JobInstance, JobStatus,
    Properties, StepExecution, StepMetrics, StepStatus, TimestampKind,
};
use batchflow_types::status::BatchStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use super::persistence::PersistenceService;

#[derive(Default)]
struct Tables {
    next_instance_id: i64,
    next_execution_id: i64,
    next_step_execution_id: i64,
    instances: BTreeMap<i64, JobInstance>,
    executions: BTreeMap<i64, JobExecution>,
    step_executions: BTreeMap<i64, StepExecution>,
    job_statuses: HashMap<i64, JobStatus>,
    step_statuses: HashMap<(i64, String), StepStatus>,
    checkpoints: HashMap<CheckpointDataKey, Value>,
}

impl Tables {
    fn execution_mut(&mut self, execution_id: i64) -> Result<&mut JobExecution, RepositoryError> {
        self.executions
            .get_mut(&execution_id)
            .ok_or(RepositoryError::NotFound)
    }

    fn execution(&self, execution_id: i64) -> Result<&JobExecution, RepositoryError> {
        self.executions
            .get(&execution_id)
            .ok_or(RepositoryError::NotFound)
    }

    fn top_level<'a>(
        &'a self,
        job_name: &'a str,
        tag: Option<&'a str>,
    ) -> impl Iterator<Item = &'a JobInstance> + 'a {
        self.instances.values().filter(move |i| {
            !i.is_sub_job() && i.job_name == job_name && tag.is_none_or(|t| i.tag == t)
        })
    }
}

/// Thread-safe in-memory store.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    async fn create_job_instance(
        &self,
        job_name: &str,
        tag: &str,
        descriptor: &str,
        parent_instance_id: Option<i64>,
    ) -> Result<JobInstance, RepositoryError> {
        let mut tables = self.tables.write();
        tables.next_instance_id += 1;
        let instance = JobInstance {
            instance_id: tables.next_instance_id,
            job_name: job_name.to_string(),
            tag: tag.to_string(),
            descriptor: descriptor.to_string(),
            parent_instance_id,
        };
        tables
            .instances
            .insert(instance.instance_id, instance.clone());
        Ok(instance)
    }

    async fn get_job_instance(
        &self,
        instance_id: i64,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        Ok(self.tables.read().instances.get(&instance_id).cloned())
    }

    async fn find_sub_job_instances(
        &self,
        parent_instance_id: i64,
        job_name: &str,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        Ok(self
            .tables
            .read()
            .instances
            .values()
            .filter(|i| i.parent_instance_id == Some(parent_instance_id) && i.job_name == job_name)
            .cloned()
            .collect())
    }

    async fn get_job_instances(
        &self,
        job_name: &str,
        tag: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        let tables = self.tables.read();
        let mut instances: Vec<JobInstance> = tables.top_level(job_name, tag).cloned().collect();
        instances.reverse();
        Ok(instances.into_iter().skip(start).take(count).collect())
    }

    async fn count_job_instances(
        &self,
        job_name: &str,
        tag: Option<&str>,
    ) -> Result<u64, RepositoryError> {
        Ok(self.tables.read().top_level(job_name, tag).count() as u64)
    }

    async fn get_job_names(&self, tag: Option<&str>) -> Result<Vec<String>, RepositoryError> {
        let tables = self.tables.read();
        let names: BTreeSet<String> = tables
            .instances
            .values()
            .filter(|i| !i.is_sub_job() && tag.is_none_or(|t| i.tag == t))
            .map(|i| i.job_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Job executions
    // -----------------------------------------------------------------------

    async fn create_job_execution(
        &self,
        instance_id: i64,
        parameters: &Properties,
    ) -> Result<JobExecution, RepositoryError> {
        let mut tables = self.tables.write();
        let job_name = tables
            .instances
            .get(&instance_id)
            .map(|i| i.job_name.clone())
            .ok_or(RepositoryError::NotFound)?;
        tables.next_execution_id += 1;
        let now = Utc::now();
        let execution = JobExecution {
            execution_id: tables.next_execution_id,
            instance_id,
            job_name,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            create_time: now,
            start_time: None,
            end_time: None,
            last_updated_time: now,
            parameters: parameters.clone(),
        };
        tables
            .executions
            .insert(execution.execution_id, execution.clone());
        Ok(execution)
    }

    async fn get_job_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        Ok(self.tables.read().executions.get(&execution_id).cloned())
    }

    async fn get_job_executions(
        &self,
        instance_id: i64,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        Ok(self
            .tables
            .read()
            .executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn most_recent_execution_id(
        &self,
        instance_id: i64,
    ) -> Result<Option<i64>, RepositoryError> {
        Ok(self
            .tables
            .read()
            .executions
            .values()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| e.execution_id)
            .max())
    }

    async fn get_running_execution_ids(
        &self,
        job_name: &str,
    ) -> Result<Vec<i64>, RepositoryError> {
        let tables = self.tables.read();
        Ok(tables
            .executions
            .values()
            .filter(|e| e.job_name == job_name && e.batch_status.is_running())
            .filter(|e| {
                tables
                    .instances
                    .get(&e.instance_id)
                    .is_some_and(|i| !i.is_sub_job())
            })
            .map(|e| e.execution_id)
            .collect())
    }

    async fn update_batch_status(
        &self,
        execution_id: i64,
        status: BatchStatus,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        let execution = tables.execution_mut(execution_id)?;
        execution.batch_status = status;
        execution.last_updated_time = Utc::now();
        Ok(())
    }

    async fn mark_execution_stopping(&self, execution_id: i64) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write();
        let execution = tables.execution_mut(execution_id)?;
        if !matches!(
            execution.batch_status,
            BatchStatus::Starting | BatchStatus::Started
        ) {
            return Ok(false);
        }
        execution.batch_status = BatchStatus::Stopping;
        execution.last_updated_time = Utc::now();
        let instance_id = execution.instance_id;
        if let Some(status) = tables.job_statuses.get_mut(&instance_id) {
            if status.latest_execution_id == Some(execution_id) {
                status.batch_status = Some(BatchStatus::Stopping);
            }
        }
        Ok(true)
    }

    async fn mark_execution_started(&self, execution_id: i64) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        let execution = tables.execution_mut(execution_id)?;
        let now = Utc::now();
        execution.batch_status = BatchStatus::Started;
        execution.start_time = Some(now);
        execution.last_updated_time = now;
        Ok(())
    }

    async fn update_execution_final(
        &self,
        execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        let execution = tables.execution_mut(execution_id)?;
        let now = Utc::now();
        execution.batch_status = status;
        execution.exit_status = exit_status.map(str::to_string);
        execution.end_time = Some(now);
        execution.last_updated_time = now;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Point queries
    // -----------------------------------------------------------------------

    async fn get_batch_status(&self, execution_id: i64) -> Result<BatchStatus, RepositoryError> {
        Ok(self.tables.read().execution(execution_id)?.batch_status)
    }

    async fn get_exit_status(&self, execution_id: i64) -> Result<Option<String>, RepositoryError> {
        Ok(self.tables.read().execution(execution_id)?.exit_status.clone())
    }

    async fn get_timestamp(
        &self,
        execution_id: i64,
        kind: TimestampKind,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let tables = self.tables.read();
        let execution = tables.execution(execution_id)?;
        Ok(match kind {
            TimestampKind::Create => Some(execution.create_time),
            TimestampKind::Start => execution.start_time,
            TimestampKind::End => execution.end_time,
            TimestampKind::LastUpdated => Some(execution.last_updated_time),
        })
    }

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    async fn create_step_execution(
        &self,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepExecution, RepositoryError> {
        let mut tables = self.tables.write();
        tables.execution(job_execution_id)?;
        tables.next_step_execution_id += 1;
        let step = StepExecution {
            step_execution_id: tables.next_step_execution_id,
            job_execution_id,
            step_name: step_name.to_string(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            start_time: None,
            end_time: None,
            metrics: StepMetrics::default(),
            persistent_user_data: None,
        };
        tables
            .step_executions
            .insert(step.step_execution_id, step.clone());
        Ok(step)
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        let slot = tables
            .step_executions
            .get_mut(&step.step_execution_id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = step.clone();
        Ok(())
    }

    async fn get_step_execution(
        &self,
        step_execution_id: i64,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        Ok(self
            .tables
            .read()
            .step_executions
            .get(&step_execution_id)
            .cloned())
    }

    async fn get_step_executions(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        Ok(self
            .tables
            .read()
            .step_executions
            .values()
            .filter(|s| s.job_execution_id == job_execution_id)
            .cloned()
            .collect())
    }

    async fn commit_chunk(&self, commit: &ChunkCommit) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        if !tables
            .step_executions
            .contains_key(&commit.step_execution.step_execution_id)
        {
            return Err(RepositoryError::NotFound);
        }
        tables.step_executions.insert(
            commit.step_execution.step_execution_id,
            commit.step_execution.clone(),
        );
        let status = &commit.step_status;
        tables.step_statuses.insert(
            (status.instance_id, status.step_name.clone()),
            status.clone(),
        );
        for (key, value) in [&commit.reader_checkpoint, &commit.writer_checkpoint]
            .into_iter()
            .flatten()
        {
            tables.checkpoints.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status records
    // -----------------------------------------------------------------------

    async fn save_job_status(&self, status: &JobStatus) -> Result<(), RepositoryError> {
        self.tables
            .write()
            .job_statuses
            .insert(status.instance_id, status.clone());
        Ok(())
    }

    async fn get_job_status(&self, instance_id: i64) -> Result<Option<JobStatus>, RepositoryError> {
        Ok(self.tables.read().job_statuses.get(&instance_id).cloned())
    }

    async fn save_step_status(&self, status: &StepStatus) -> Result<(), RepositoryError> {
        self.tables.write().step_statuses.insert(
            (status.instance_id, status.step_name.clone()),
            status.clone(),
        );
        Ok(())
    }

    async fn get_step_status(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<Option<StepStatus>, RepositoryError> {
        Ok(self
            .tables
            .read()
            .step_statuses
            .get(&(instance_id, step_name.to_string()))
            .cloned())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn get_checkpoint(
        &self,
        key: &CheckpointDataKey,
    ) -> Result<Option<Value>, RepositoryError> {
        Ok(self.tables.read().checkpoints.get(key).cloned())
    }

    async fn set_checkpoint(
        &self,
        key: &CheckpointDataKey,
        value: &Value,
    ) -> Result<(), RepositoryError> {
        self.tables
            .write()
            .checkpoints
            .insert(key.clone(), value.clone());
        Ok(())
    }

    async fn delete_checkpoints(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write();
        for stream in [CheckpointStream::Reader, CheckpointStream::Writer] {
            tables
                .checkpoints
                .remove(&CheckpointDataKey::new(instance_id, step_name, stream));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    async fn purge(&self, tag: &str) -> Result<u64, RepositoryError> {
        let mut tables = self.tables.write();
        let roots: BTreeSet<i64> = tables
            .instances
            .values()
            .filter(|i| !i.is_sub_job() && i.tag == tag)
            .map(|i| i.instance_id)
            .collect();

        // Sub-jobs may nest (a partitioned step inside a split flow).
        let mut doomed = roots.clone();
        loop {
            let children: Vec<i64> = tables
                .instances
                .values()
                .filter(|i| {
                    i.parent_instance_id.is_some_and(|p| doomed.contains(&p))
                        && !doomed.contains(&i.instance_id)
                })
                .map(|i| i.instance_id)
                .collect();
            if children.is_empty() {
                break;
            }
            doomed.extend(children);
        }

        let executions: BTreeSet<i64> = tables
            .executions
            .values()
            .filter(|e| doomed.contains(&e.instance_id))
            .map(|e| e.execution_id)
            .collect();
        tables.instances.retain(|id, _| !doomed.contains(id));
        tables.executions.retain(|id, _| !executions.contains(id));
        tables
            .step_executions
            .retain(|_, s| !executions.contains(&s.job_execution_id));
        tables.job_statuses.retain(|id, _| !doomed.contains(id));
        tables
            .step_statuses
            .retain(|(id, _), _| !doomed.contains(id));
        tables
            .checkpoints
            .retain(|key, _| !doomed.contains(&key.instance_id));
        Ok(roots.len() as u64)
    }
}
