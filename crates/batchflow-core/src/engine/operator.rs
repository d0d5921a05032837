//! Operator API: the entry point presentation layers use.
//!
//! Every operation that touches a job instance checks the caller's
//! authorization tag against the instance's tag first; an unauthorized caller
//! gets [`BatchError::Security`] and no data.

use std::sync::Arc;
use std::time::Duration;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::{JobExecution, JobInstance, Properties, StepExecution};
use batchflow_types::status::BatchStatus;
use tokio::sync::broadcast;

use super::callback::JobEndCallback;
use super::handle::JobExecutionHandle;
use super::kernel::BatchKernel;
use super::services::ServiceContext;
use crate::error::BatchError;

#[derive(Debug, Clone)]
pub struct JobOperator {
    kernel: Arc<BatchKernel>,
}

impl JobOperator {
    pub fn new(services: ServiceContext) -> Self {
        Self {
            kernel: BatchKernel::new(services),
        }
    }

    pub fn kernel(&self) -> &Arc<BatchKernel> {
        &self.kernel
    }

    fn services(&self) -> &ServiceContext {
        self.kernel.services()
    }

    fn authorize(&self, instance: &JobInstance) -> Result<(), BatchError> {
        let security = &self.services().security;
        if security.is_authorized(&instance.tag) {
            Ok(())
        } else {
            tracing::warn!(
                instance_id = instance.instance_id,
                tag = %security.current_tag(),
                "unauthorized access to job instance"
            );
            Err(BatchError::Security {
                tag: security.current_tag(),
                instance_id: instance.instance_id,
            })
        }
    }

    async fn authorized_instance(&self, instance_id: i64) -> Result<JobInstance, BatchError> {
        let instance = self
            .services()
            .persistence
            .get_job_instance(instance_id)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;
        self.authorize(&instance)?;
        Ok(instance)
    }

    async fn authorized_execution(&self, execution_id: i64) -> Result<JobExecution, BatchError> {
        let execution = self
            .services()
            .persistence
            .get_job_execution(execution_id)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        self.authorized_instance(execution.instance_id).await?;
        Ok(execution)
    }

    /// Fail with `NoSuchJob` when no visible instance of `job_name` exists.
    async fn visible_instance_count(&self, job_name: &str) -> Result<u64, BatchError> {
        let tag = self.services().security.visible_tag();
        let count = self
            .services()
            .persistence
            .count_job_instances(job_name, tag.as_deref())
            .await?;
        if count == 0 {
            return Err(BatchError::NoSuchJob(job_name.to_string()));
        }
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start a new instance of `job_name`. Returns once the execution is queued.
    pub async fn start(&self, job_name: &str, parameters: Properties) -> Result<i64, BatchError> {
        let execution = self.kernel.start_job(job_name, parameters).await?;
        Ok(execution.execution_id)
    }

    /// Restart the instance of `execution_id`, which must be its most recent execution.
    pub async fn restart(
        &self,
        execution_id: i64,
        parameters: Properties,
    ) -> Result<i64, BatchError> {
        self.authorized_execution(execution_id).await?;
        let execution = self.kernel.restart_job(execution_id, parameters).await?;
        Ok(execution.execution_id)
    }

    pub async fn stop(&self, execution_id: i64) -> Result<(), BatchError> {
        self.authorized_execution(execution_id).await?;
        self.kernel.stop_job(execution_id).await
    }

    /// Mark a finished execution, and its instance, as never to be restarted.
    pub async fn abandon(&self, execution_id: i64) -> Result<(), BatchError> {
        let execution = self.authorized_execution(execution_id).await?;
        if self.kernel.is_execution_running(execution_id)
            || matches!(
                execution.batch_status,
                BatchStatus::Starting | BatchStatus::Started
            )
        {
            return Err(BatchError::ExecutionIsRunning {
                execution_id,
                status: execution.batch_status,
            });
        }

        let persistence = &self.services().persistence;
        persistence
            .update_batch_status(execution_id, BatchStatus::Abandoned)
            .await?;
        if let Some(mut status) = persistence.get_job_status(execution.instance_id).await? {
            if status.latest_execution_id == Some(execution_id) {
                status.batch_status = Some(BatchStatus::Abandoned);
                persistence.save_job_status(&status).await?;
            }
        }
        tracing::info!(execution_id, instance_id = execution.instance_id, "execution abandoned");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_job_instance(&self, execution_id: i64) -> Result<JobInstance, BatchError> {
        let execution = self.authorized_execution(execution_id).await?;
        self.authorized_instance(execution.instance_id).await
    }

    pub async fn get_job_execution(&self, execution_id: i64) -> Result<JobExecution, BatchError> {
        self.authorized_execution(execution_id).await
    }

    pub async fn get_job_executions(
        &self,
        instance_id: i64,
    ) -> Result<Vec<JobExecution>, BatchError> {
        self.authorized_instance(instance_id).await?;
        Ok(self
            .services()
            .persistence
            .get_job_executions(instance_id)
            .await?)
    }

    pub async fn get_step_executions(
        &self,
        execution_id: i64,
    ) -> Result<Vec<StepExecution>, BatchError> {
        self.authorized_execution(execution_id).await?;
        Ok(self
            .services()
            .persistence
            .get_step_executions(execution_id)
            .await?)
    }

    pub async fn get_parameters(&self, execution_id: i64) -> Result<Properties, BatchError> {
        Ok(self.authorized_execution(execution_id).await?.parameters)
    }

    /// Visible top-level instances of `job_name`, newest first.
    pub async fn get_job_instances(
        &self,
        job_name: &str,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>, BatchError> {
        self.visible_instance_count(job_name).await?;
        let tag = self.services().security.visible_tag();
        Ok(self
            .services()
            .persistence
            .get_job_instances(job_name, tag.as_deref(), start, count)
            .await?)
    }

    pub async fn get_job_instance_count(&self, job_name: &str) -> Result<u64, BatchError> {
        self.visible_instance_count(job_name).await
    }

    /// Ids of visible executions of `job_name` that are still running.
    pub async fn get_running_executions(&self, job_name: &str) -> Result<Vec<i64>, BatchError> {
        self.visible_instance_count(job_name).await?;
        let persistence = &self.services().persistence;
        let mut visible = Vec::new();
        for execution_id in persistence.get_running_execution_ids(job_name).await? {
            let Some(execution) = persistence.get_job_execution(execution_id).await? else {
                continue;
            };
            let Some(instance) = persistence.get_job_instance(execution.instance_id).await? else {
                continue;
            };
            if self.services().security.is_authorized(&instance.tag) {
                visible.push(execution_id);
            }
        }
        Ok(visible)
    }

    pub async fn get_job_names(&self) -> Result<Vec<String>, BatchError> {
        let tag = self.services().security.visible_tag();
        Ok(self.services().persistence.get_job_names(tag.as_deref()).await?)
    }

    pub fn execution_handle(&self, execution_id: i64) -> JobExecutionHandle {
        JobExecutionHandle::new(execution_id, self.services().persistence.clone())
    }

    // -----------------------------------------------------------------------
    // Administration
    // -----------------------------------------------------------------------

    /// Delete every instance carrying `tag`. Only that tag or an admin may purge.
    pub async fn purge(&self, tag: &str) -> Result<u64, BatchError> {
        let security = &self.services().security;
        if !security.is_authorized(tag) {
            return Err(BatchError::Security {
                tag: security.current_tag(),
                instance_id: 0,
            });
        }
        let removed = self.services().persistence.purge(tag).await?;
        tracing::info!(tag, removed, "purged job instances");
        Ok(removed)
    }

    pub fn register_callback(&self, callback: Arc<dyn JobEndCallback>) {
        self.services().callbacks.register(callback);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.services().events.subscribe()
    }

    /// Wait until the execution ends, or until `timeout` passes.
    ///
    /// Returns the error that ended the execution if it ended with one;
    /// otherwise the execution as persisted at return time.
    pub async fn wait_for_termination(
        &self,
        execution_id: i64,
        timeout: Duration,
    ) -> Result<JobExecution, BatchError> {
        self.authorized_execution(execution_id).await?;
        if self.kernel.is_execution_running(execution_id) {
            let callbacks = &self.services().callbacks;
            if tokio::time::timeout(timeout, callbacks.wait_for_end(execution_id))
                .await
                .is_err()
            {
                tracing::debug!(execution_id, "wait for termination timed out");
            }
        }
        if let Some(e) = self.kernel.execution_error(execution_id) {
            return Err(e);
        }
        self.authorized_execution(execution_id).await
    }
}
