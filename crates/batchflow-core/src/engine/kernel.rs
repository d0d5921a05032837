//! Batch kernel: owns the running-execution registry and submits work.
//!
//! Starting or restarting reserves the job instance in the registry before
//! any execution row is written, so two racing attempts on the same instance
//! leave exactly one execution behind. Both calls return once the execution
//! is registered and queued on the pool.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use batchflow_types::error::RepositoryError;
use batchflow_types::execution::{JobExecution, JobInstance, JobStatus, Properties};
use batchflow_types::model::JobDefinition;
use batchflow_types::status::BatchStatus;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::context::JobContext;
use super::job::{JobController, RuntimeJob, RuntimeKind};
use super::services::ServiceContext;
use crate::error::BatchError;

/// Failures kept for late `wait_for_termination` callers; older ones are dropped.
const RETAINED_FAILURES: usize = 1024;

#[derive(Debug, Default)]
struct Registry {
    executions: HashMap<i64, Arc<RuntimeJob>>,
    instances: HashSet<i64>,
}

/// Result of asking the kernel for a partition or flow-in-split sub-job.
pub(crate) enum SubJob {
    Run(Arc<RuntimeJob>),
    /// The sub-job completed in an earlier execution of its parent.
    AlreadyCompleted { exit_status: Option<String> },
}

pub struct BatchKernel {
    services: ServiceContext,
    registry: Mutex<Registry>,
    /// Errors that ended top-level executions, reported by `wait_for_termination`.
    failures: DashMap<i64, BatchError>,
    failure_order: Mutex<VecDeque<i64>>,
}

impl BatchKernel {
    pub fn new(services: ServiceContext) -> Arc<Self> {
        Arc::new(Self {
            services,
            registry: Mutex::new(Registry::default()),
            failures: DashMap::new(),
            failure_order: Mutex::new(VecDeque::new()),
        })
    }

    pub fn services(&self) -> &ServiceContext {
        &self.services
    }

    // -----------------------------------------------------------------------
    // Start / restart
    // -----------------------------------------------------------------------

    pub async fn start_job(
        self: &Arc<Self>,
        job_name: &str,
        parameters: Properties,
    ) -> Result<JobExecution, BatchError> {
        let definition = self.services.loader.load(job_name).await?;
        definition
            .validate()
            .map_err(|e| BatchError::InvalidDefinition(e.to_string()))?;
        let descriptor = definition.to_descriptor().map_err(RepositoryError::from)?;
        let instance = self
            .services
            .persistence
            .create_job_instance(
                &definition.id,
                &self.services.security.current_tag(),
                &descriptor,
                None,
            )
            .await?;

        self.reserve_instance(instance.instance_id)?;
        let instance_id = instance.instance_id;
        let result = self.launch(instance, definition, parameters, None).await;
        if result.is_err() {
            self.release_instance(instance_id);
        }
        result
    }

    pub async fn restart_job(
        self: &Arc<Self>,
        execution_id: i64,
        parameters: Properties,
    ) -> Result<JobExecution, BatchError> {
        let persistence = &self.services.persistence;
        let previous = persistence
            .get_job_execution(execution_id)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(execution_id))?;
        let instance_id = previous.instance_id;
        let instance = persistence
            .get_job_instance(instance_id)
            .await?
            .ok_or(BatchError::NoSuchJobInstance(instance_id))?;

        if persistence.most_recent_execution_id(instance_id).await? != Some(execution_id) {
            return Err(BatchError::NotMostRecentExecution {
                execution_id,
                instance_id,
            });
        }
        let status = persistence.get_job_status(instance_id).await?;
        match status.as_ref().and_then(|s| s.batch_status) {
            Some(BatchStatus::Completed) => {
                return Err(BatchError::AlreadyComplete { instance_id });
            }
            Some(BatchStatus::Abandoned) => return Err(BatchError::Abandoned { instance_id }),
            _ => {}
        }
        let definition =
            JobDefinition::from_descriptor(&instance.descriptor).map_err(RepositoryError::from)?;
        if !definition.restartable {
            return Err(BatchError::NotRestartable(definition.id));
        }

        self.reserve_instance(instance_id)?;
        let restart_on = status.and_then(|s| s.restart_on);
        let result = async {
            if previous.batch_status.is_running() {
                // Nothing in this process runs it: the previous process died.
                tracing::warn!(
                    execution_id,
                    instance_id,
                    status = %previous.batch_status,
                    "previous execution was left running, marking it FAILED"
                );
                persistence
                    .update_execution_final(
                        execution_id,
                        BatchStatus::Failed,
                        Some(BatchStatus::Failed.as_str()),
                    )
                    .await?;
            }
            self.launch(instance, definition, parameters, restart_on)
                .await
        }
        .await;
        if result.is_err() {
            self.release_instance(instance_id);
        }
        result
    }

    fn reserve_instance(&self, instance_id: i64) -> Result<(), BatchError> {
        if !self.registry.lock().instances.insert(instance_id) {
            return Err(BatchError::AlreadyExecuting { instance_id });
        }
        Ok(())
    }

    fn release_instance(&self, instance_id: i64) {
        self.registry.lock().instances.remove(&instance_id);
    }

    async fn launch(
        self: &Arc<Self>,
        instance: JobInstance,
        definition: JobDefinition,
        parameters: Properties,
        restart_on: Option<String>,
    ) -> Result<JobExecution, BatchError> {
        let persistence = &self.services.persistence;
        let execution = persistence
            .create_job_execution(instance.instance_id, &parameters)
            .await?;

        let mut status = persistence
            .get_job_status(instance.instance_id)
            .await?
            .unwrap_or_else(|| JobStatus::new(instance.clone()));
        status.latest_execution_id = Some(execution.execution_id);
        status.batch_status = Some(BatchStatus::Starting);
        status.exit_status = None;
        status.current_step = None;
        status.restart_on = None;
        persistence.save_job_status(&status).await?;

        let context = JobContext::new(
            definition.id.clone(),
            instance.instance_id,
            execution.execution_id,
            definition.properties.clone(),
            parameters,
            CancellationToken::new(),
        );
        let job = Arc::new(RuntimeJob {
            definition: Arc::new(definition),
            instance,
            execution_id: execution.execution_id,
            context: Arc::new(context),
            restart_on,
            kind: RuntimeKind::TopLevel,
        });

        {
            let mut registry = self.registry.lock();
            if registry.executions.contains_key(&job.execution_id) {
                return Err(BatchError::InternalConsistency(format!(
                    "execution {} is already registered",
                    job.execution_id
                )));
            }
            registry.executions.insert(job.execution_id, job.clone());
        }

        tracing::info!(
            job = %job.context.job_name(),
            instance_id = job.instance.instance_id,
            execution_id = job.execution_id,
            "job execution submitted"
        );
        let kernel = self.clone();
        self.services.pool.execute_task(Box::pin(async move {
            JobController::new(&kernel, &job).run().await;
        }));
        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // Stop / completion
    // -----------------------------------------------------------------------

    /// Request a cooperative stop of a running top-level execution.
    pub async fn stop_job(&self, execution_id: i64) -> Result<(), BatchError> {
        let job = self.registry.lock().executions.get(&execution_id).cloned();
        let Some(job) = job else {
            return match self.services.persistence.get_job_execution(execution_id).await? {
                Some(_) => {
                    tracing::warn!(execution_id, "stop requested for an execution that is not running");
                    Err(BatchError::NotRunning(execution_id))
                }
                None => Err(BatchError::NoSuchJobExecution(execution_id)),
            };
        };

        // The controller may already have persisted a final status; that wins.
        if !self
            .services
            .persistence
            .mark_execution_stopping(execution_id)
            .await?
        {
            tracing::warn!(execution_id, "stop requested for an execution that already ended");
            return Err(BatchError::NotRunning(execution_id));
        }
        job.context.set_batch_status(BatchStatus::Stopping);
        job.context.stop_token().cancel();
        tracing::info!(
            execution_id,
            job = %job.context.job_name(),
            "stop requested"
        );
        Ok(())
    }

    pub fn is_execution_running(&self, execution_id: i64) -> bool {
        self.registry.lock().executions.contains_key(&execution_id)
    }

    /// Ids of the top-level executions running in this process.
    pub fn running_execution_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.registry.lock().executions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Error that ended an execution, if it ended with one.
    pub fn execution_error(&self, execution_id: i64) -> Option<BatchError> {
        self.failures.get(&execution_id).map(|e| e.value().clone())
    }

    pub(crate) fn job_execution_done(&self, job: &RuntimeJob, error: Option<BatchError>) {
        // Record the error before deregistering; waiters check it once not running.
        if let Some(e) = error {
            self.record_failure(job.execution_id, e);
        }
        {
            let mut registry = self.registry.lock();
            registry.executions.remove(&job.execution_id);
            registry.instances.remove(&job.instance.instance_id);
        }
        tracing::debug!(execution_id = job.execution_id, "execution deregistered");
        self.services.callbacks.job_ended(job.execution_id);
    }

    fn record_failure(&self, execution_id: i64, error: BatchError) {
        self.failures.insert(execution_id, error);
        let mut order = self.failure_order.lock();
        order.push_back(execution_id);
        while order.len() > RETAINED_FAILURES {
            if let Some(oldest) = order.pop_front() {
                self.failures.remove(&oldest);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sub-jobs
    // -----------------------------------------------------------------------

    /// Create (or, on restart, reuse) the sub-job instance named
    /// `definition.id` under `parent` and a new execution for it.
    ///
    /// An existing sub-instance whose last run COMPLETED is skipped unless
    /// `rerun_completed` is set.
    pub(crate) async fn build_sub_job(
        &self,
        parent: &RuntimeJob,
        definition: JobDefinition,
        kind: RuntimeKind,
        rerun_completed: bool,
        stop: &CancellationToken,
    ) -> Result<SubJob, BatchError> {
        let persistence = &self.services.persistence;
        let parent_id = parent.instance.instance_id;

        let mut existing = persistence
            .find_sub_job_instances(parent_id, &definition.id)
            .await?;
        if existing.len() > 1 {
            return Err(BatchError::InternalConsistency(format!(
                "{} sub-job instances named '{}' under instance {parent_id}",
                existing.len(),
                definition.id
            )));
        }

        let (instance, status) = match existing.pop() {
            Some(instance) => {
                let status = persistence.get_job_status(instance.instance_id).await?;
                let completed = status
                    .as_ref()
                    .is_some_and(|s| s.batch_status == Some(BatchStatus::Completed));
                if completed && !rerun_completed {
                    return Ok(SubJob::AlreadyCompleted {
                        exit_status: status.and_then(|s| s.exit_status),
                    });
                }
                (instance, status)
            }
            None => {
                let descriptor = definition.to_descriptor().map_err(RepositoryError::from)?;
                let instance = persistence
                    .create_job_instance(
                        &definition.id,
                        &parent.instance.tag,
                        &descriptor,
                        Some(parent_id),
                    )
                    .await?;
                (instance, None)
            }
        };

        let parameters = parent.context.parameters().clone();
        let execution = persistence
            .create_job_execution(instance.instance_id, &parameters)
            .await?;
        let mut status = status.unwrap_or_else(|| JobStatus::new(instance.clone()));
        status.latest_execution_id = Some(execution.execution_id);
        status.batch_status = Some(BatchStatus::Starting);
        status.exit_status = None;
        persistence.save_job_status(&status).await?;

        let context = JobContext::new(
            definition.id.clone(),
            instance.instance_id,
            execution.execution_id,
            definition.properties.clone(),
            parameters,
            stop.child_token(),
        );
        tracing::debug!(
            sub_job = %definition.id,
            parent_execution_id = parent.execution_id,
            execution_id = execution.execution_id,
            kind = ?kind,
            "sub-job built"
        );
        Ok(SubJob::Run(Arc::new(RuntimeJob {
            definition: Arc::new(definition),
            instance,
            execution_id: execution.execution_id,
            context: Arc::new(context),
            restart_on: None,
            kind,
        })))
    }
}

impl std::fmt::Debug for BatchKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("BatchKernel")
            .field("running", &registry.executions.len())
            .field("failures", &self.failures.len())
            .finish()
    }
}
