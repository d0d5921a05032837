//! Job-level lifecycle.
//!
//! A [`RuntimeJob`] is one running execution: the definition it navigates,
//! its instance, and its [`JobContext`]. The [`JobController`] drives a
//! top-level execution from STARTED to its final status, or runs the flow of
//! a flow-in-split sub-job and reports the outcome to the owning split.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::JobInstance;
use batchflow_types::model::JobDefinition;
use batchflow_types::status::{BatchStatus, ExtendedBatchStatus};

use super::context::{InjectionContext, JobContext};
use super::flow::{ElementOutcome, ExecutionTransitioner};
use super::kernel::BatchKernel;
use futures_util::FutureExt;

use crate::artifact::JobListener;
use crate::error::BatchError;

/// What kind of execution a [`RuntimeJob`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    TopLevel,
    Partition { index: u32 },
    FlowInSplit,
}

/// One running job execution.
#[derive(Debug)]
pub struct RuntimeJob {
    pub definition: Arc<JobDefinition>,
    pub instance: JobInstance,
    pub execution_id: i64,
    pub context: Arc<JobContext>,
    /// Element a previous `stop` transition asked this run to start from.
    pub restart_on: Option<String>,
    pub kind: RuntimeKind,
}

pub(crate) struct JobController<'a> {
    kernel: &'a Arc<BatchKernel>,
    job: &'a Arc<RuntimeJob>,
}

impl<'a> JobController<'a> {
    pub(crate) fn new(kernel: &'a Arc<BatchKernel>, job: &'a Arc<RuntimeJob>) -> Self {
        Self { kernel, job }
    }

    /// Run a top-level execution to its end and deregister it.
    pub(crate) async fn run(self) {
        let error = match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(result) => result.err(),
            Err(payload) => {
                self.finish(BatchStatus::Failed, None).await;
                Some(BatchError::from_panic(payload))
            }
        };
        if let Some(e) = &error {
            tracing::error!(
                job = %self.job.context.job_name(),
                execution_id = self.job.execution_id,
                error = %e,
                "job execution failed"
            );
        }
        self.kernel.job_execution_done(self.job, error);
    }

    async fn execute(&self) -> Result<(), BatchError> {
        let services = self.kernel.services();
        let job = self.job;

        if let Err(e) = self.mark_started().await {
            self.finish(BatchStatus::Failed, None).await;
            return Err(e);
        }
        tracing::info!(
            job = %job.context.job_name(),
            instance_id = job.instance.instance_id,
            execution_id = job.execution_id,
            restart_on = ?job.restart_on,
            "job started"
        );
        services.events.publish(BatchEvent::JobStarted {
            execution_id: job.execution_id,
            instance_id: job.instance.instance_id,
            job_name: job.context.job_name().to_string(),
        });

        let ctx = InjectionContext::for_job(job.context.clone());
        let listeners = job
            .definition
            .listeners
            .iter()
            .map(|l| services.artifacts.create_job_listener(l, &ctx))
            .collect::<Result<Vec<_>, _>>();
        let mut listeners = match listeners {
            Ok(listeners) => listeners,
            Err(e) => {
                self.finish(BatchStatus::Failed, None).await;
                return Err(e);
            }
        };

        let outcome = self.run_body(&mut listeners).await;

        let mut after_failed = false;
        for listener in listeners.iter_mut() {
            if let Err(e) = listener.after_job().await {
                tracing::warn!(
                    execution_id = job.execution_id,
                    error = %e,
                    "job listener failed after job"
                );
                after_failed = true;
            }
        }

        match outcome {
            Ok(outcome) => {
                let mut batch_status = self.final_batch_status(&outcome);
                if after_failed {
                    batch_status = BatchStatus::Failed;
                }
                let restart_on = match outcome.status.extended {
                    ExtendedBatchStatus::JslStop => outcome.status.restart_on.clone(),
                    _ => None,
                };
                self.persist_final(batch_status, outcome.status.exit_status, restart_on)
                    .await
            }
            Err(e) => {
                self.finish(BatchStatus::Failed, None).await;
                Err(e)
            }
        }
    }

    async fn run_body(
        &self,
        listeners: &mut [Box<dyn JobListener>],
    ) -> Result<ElementOutcome, BatchError> {
        for listener in listeners.iter_mut() {
            listener.before_job().await?;
        }
        ExecutionTransitioner::new(
            self.kernel,
            self.job,
            &self.job.definition.elements,
            self.job.restart_on.as_deref(),
        )
        .run()
        .await
    }

    async fn mark_started(&self) -> Result<(), BatchError> {
        let persistence = &self.kernel.services().persistence;
        let job = self.job;
        // A stop that arrived while STARTING keeps its STOPPING status.
        if job.context.is_stop_requested() {
            return Ok(());
        }
        persistence.mark_execution_started(job.execution_id).await?;
        job.context.set_batch_status(BatchStatus::Started);
        if let Some(mut status) = persistence.get_job_status(job.instance.instance_id).await? {
            status.batch_status = Some(BatchStatus::Started);
            persistence.save_job_status(&status).await?;
        }
        Ok(())
    }

    /// Map the navigation outcome to the execution's final batch status.
    fn final_batch_status(&self, outcome: &ElementOutcome) -> BatchStatus {
        match outcome.status.extended {
            ExtendedBatchStatus::NormalCompletion | ExtendedBatchStatus::DoNotRun => {
                if self.job.context.batch_status() == BatchStatus::Failed {
                    BatchStatus::Failed
                } else {
                    BatchStatus::Completed
                }
            }
            ExtendedBatchStatus::ExceptionThrown | ExtendedBatchStatus::JslFail => {
                BatchStatus::Failed
            }
            ExtendedBatchStatus::JobOperatorStopping | ExtendedBatchStatus::JslStop => {
                BatchStatus::Stopped
            }
            ExtendedBatchStatus::JslEnd => BatchStatus::Completed,
        }
    }

    /// Persist the final status; a failure here turns the execution FAILED.
    async fn persist_final(
        &self,
        batch_status: BatchStatus,
        element_exit: Option<String>,
        restart_on: Option<String>,
    ) -> Result<(), BatchError> {
        let job = self.job;
        let persistence = &self.kernel.services().persistence;

        job.context.set_batch_status(batch_status);
        let exit_status = job
            .context
            .exit_status()
            .or(element_exit)
            .unwrap_or_else(|| batch_status.to_string());
        job.context.set_exit_status(exit_status.clone());

        let result: Result<(), BatchError> = async {
            persistence
                .update_execution_final(job.execution_id, batch_status, Some(&exit_status))
                .await?;
            if let Some(mut status) = persistence.get_job_status(job.instance.instance_id).await? {
                status.batch_status = Some(batch_status);
                status.exit_status = Some(exit_status.clone());
                status.restart_on = restart_on;
                persistence.save_job_status(&status).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            self.finish(BatchStatus::Failed, None).await;
            return Err(BatchError::fatal(e));
        }

        tracing::info!(
            job = %job.context.job_name(),
            execution_id = job.execution_id,
            batch_status = %batch_status,
            exit_status = %exit_status,
            "job ended"
        );
        self.kernel.services().events.publish(BatchEvent::JobEnded {
            execution_id: job.execution_id,
            instance_id: job.instance.instance_id,
            batch_status,
            exit_status: Some(exit_status),
        });
        Ok(())
    }

    /// Best-effort final persistence on an error path.
    async fn finish(&self, batch_status: BatchStatus, exit_status: Option<String>) {
        let job = self.job;
        let persistence = &self.kernel.services().persistence;
        job.context.set_batch_status(batch_status);
        let exit_status = job
            .context
            .exit_status()
            .or(exit_status)
            .unwrap_or_else(|| batch_status.to_string());

        if let Err(e) = persistence
            .update_execution_final(job.execution_id, batch_status, Some(&exit_status))
            .await
        {
            tracing::error!(execution_id = job.execution_id, error = %e, "could not persist final status");
        }
        match persistence.get_job_status(job.instance.instance_id).await {
            Ok(Some(mut status)) => {
                status.batch_status = Some(batch_status);
                status.exit_status = Some(exit_status.clone());
                if let Err(e) = persistence.save_job_status(&status).await {
                    tracing::error!(instance_id = job.instance.instance_id, error = %e, "could not persist job status");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(instance_id = job.instance.instance_id, error = %e, "could not load job status");
            }
        }
        self.kernel.services().events.publish(BatchEvent::JobEnded {
            execution_id: job.execution_id,
            instance_id: job.instance.instance_id,
            batch_status,
            exit_status: Some(exit_status),
        });
    }

    /// Run the elements of a flow-in-split sub-job and persist its outcome.
    pub(crate) async fn run_flow_in_split(self) -> Result<ElementOutcome, BatchError> {
        match AssertUnwindSafe(self.execute_flow_in_split()).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                self.finish(BatchStatus::Failed, None).await;
                Err(BatchError::from_panic(payload))
            }
        }
    }

    async fn execute_flow_in_split(&self) -> Result<ElementOutcome, BatchError> {
        if let Err(e) = self.mark_started().await {
            self.finish(BatchStatus::Failed, None).await;
            return Err(e);
        }
        let result = ExecutionTransitioner::new(
            self.kernel,
            self.job,
            &self.job.definition.elements,
            None,
        )
        .run()
        .await;

        match &result {
            Ok(outcome) => {
                let batch_status = self.final_batch_status(outcome);
                self.persist_final(batch_status, outcome.status.exit_status.clone(), None)
                    .await?;
            }
            Err(_) => self.finish(BatchStatus::Failed, None).await,
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use batchflow_types::error::ArtifactError;
    use batchflow_types::execution::Properties;
    use batchflow_types::model::ArtifactRef;
    use parking_lot::Mutex;

    use super::*;
    use crate::test_support::{Harness, batchlet_step, job, script, step};

    struct AuditListener {
        fail_before: bool,
        fail_after: bool,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl JobListener for AuditListener {
        async fn before_job(&mut self) -> Result<(), ArtifactError> {
            self.events.lock().push("before_job");
            if self.fail_before {
                return Err(ArtifactError::new("audit", "refused"));
            }
            Ok(())
        }

        async fn after_job(&mut self) -> Result<(), ArtifactError> {
            self.events.lock().push("after_job");
            if self.fail_after {
                return Err(ArtifactError::new("audit", "refused"));
            }
            Ok(())
        }
    }

    fn audited(listener: ArtifactRef) -> (Harness, Arc<Mutex<Vec<&'static str>>>) {
        let harness = Harness::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        harness.artifacts.register_job_listener("audit", move |ctx| {
            Ok(Box::new(AuditListener {
                fail_before: ctx.property("fail_before").is_some(),
                fail_after: ctx.property("fail_after").is_some(),
                events: sink.clone(),
            }) as Box<dyn JobListener>)
        });
        let mut definition = job("audited", vec![step(batchlet_step("only", script("OK")))]);
        definition.listeners.push(listener);
        harness.register(definition);
        (harness, events)
    }

    #[tokio::test]
    async fn test_listeners_wrap_the_job() {
        let (harness, events) = audited(ArtifactRef::new("audit"));
        let execution = harness.run("audited").await.unwrap();

        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(*events.lock(), vec!["before_job", "after_job"]);
        assert_eq!(harness.probes.batchlet_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_before_job_skips_the_body_but_still_runs_after_job() {
        let (harness, events) = audited(ArtifactRef::new("audit").with_property("fail_before", "1"));
        let id = harness
            .operator
            .start("audited", Properties::new())
            .await
            .unwrap();

        assert!(harness.wait(id).await.is_err());
        let execution = harness.operator.get_job_execution(id).await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert_eq!(*events.lock(), vec!["before_job", "after_job"]);
        assert_eq!(harness.probes.batchlet_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_after_job_fails_a_finished_job() {
        let (harness, _) = audited(ArtifactRef::new("audit").with_property("fail_after", "1"));
        let execution = harness.run("audited").await.unwrap();

        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert_eq!(harness.probes.batchlet_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_listener_fails_the_execution() {
        let harness = Harness::new();
        let mut definition = job("unheard", vec![step(batchlet_step("only", script("OK")))]);
        definition.listeners.push(ArtifactRef::new("nobody"));
        harness.register(definition);

        let id = harness
            .operator
            .start("unheard", Properties::new())
            .await
            .unwrap();
        assert!(matches!(
            harness.wait(id).await.unwrap_err(),
            BatchError::ArtifactNotFound { .. }
        ));
        assert_eq!(
            harness.operator.get_job_execution(id).await.unwrap().batch_status,
            BatchStatus::Failed
        );
    }
}
