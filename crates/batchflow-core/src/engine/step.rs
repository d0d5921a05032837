//! Per-step state machine.
//!
//! Decides whether the step runs at all, moves it through
//! STARTING -> STARTED -> (STOPPING ->) COMPLETED | STOPPED | FAILED, runs the
//! body (chunk loop, batchlet or partition fan-out) between the pre- and
//! post-step artifacts, and persists the final statuses. Failures of the body
//! only fail the step; failures of the status bookkeeping fail the job.

use std::sync::Arc;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::{StepExecution, StepMetrics, StepStatus};
use batchflow_types::model::{StepBody, StepDefinition};
use batchflow_types::status::{BatchStatus, ExecutionStatus, ExtendedBatchStatus};
use chrono::Utc;

use super::checkpoint::CheckpointManager;
use super::chunk::ChunkProcessor;
use super::context::{InjectionContext, StepContext};
use super::flow::ElementOutcome;
use super::job::RuntimeJob;
use super::kernel::BatchKernel;
use super::partition::{PartitionCoordinator, PartitionSink};
use super::services::ServiceContext;
use crate::artifact::StepListener;
use crate::error::BatchError;

/// How a step that is about to run relates to earlier runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartMode {
    /// No earlier run of this step in this job instance.
    First,
    /// An earlier run stopped or failed; resume from its checkpoint.
    Resume,
    /// An earlier run completed and the step allows starting again.
    Rerun,
}

enum Eligibility {
    DoNotRun(StepStatus),
    Run {
        step_execution: StepExecution,
        step_status: StepStatus,
        mode: StartMode,
    },
}

/// Step-level artifacts that surround the body.
enum Surroundings<'a> {
    Listeners(Vec<Box<dyn StepListener>>),
    Partitioned(PartitionCoordinator<'a>),
}

pub(crate) struct StepController<'a> {
    kernel: &'a Arc<BatchKernel>,
    job: &'a Arc<RuntimeJob>,
    step: &'a StepDefinition,
    sink: Option<PartitionSink>,
}

impl<'a> StepController<'a> {
    pub(crate) fn new(
        kernel: &'a Arc<BatchKernel>,
        job: &'a Arc<RuntimeJob>,
        step: &'a StepDefinition,
        sink: Option<PartitionSink>,
    ) -> Self {
        Self {
            kernel,
            job,
            step,
            sink,
        }
    }

    fn services(&self) -> &'a ServiceContext {
        self.kernel.services()
    }

    pub(crate) async fn execute(mut self) -> Result<ElementOutcome, BatchError> {
        let eligibility = match self.should_step_be_executed().await {
            Ok(eligibility) => eligibility,
            Err(e) => {
                tracing::error!(
                    step = %self.step.id,
                    execution_id = self.job.execution_id,
                    error = %e,
                    "could not determine whether step should run, failing job"
                );
                self.job.context.set_batch_status(BatchStatus::Failed);
                return Err(BatchError::fatal(e));
            }
        };

        let (mut step_execution, mut step_status, mode) = match eligibility {
            Eligibility::DoNotRun(status) => return self.do_not_run(status).await,
            Eligibility::Run {
                step_execution,
                step_status,
                mode,
            } => (step_execution, step_status, mode),
        };

        let step_ctx = Arc::new(StepContext::new(
            self.step.id.clone(),
            step_execution.step_execution_id,
            self.step.properties.clone(),
        ));

        let mut surroundings = match self
            .start_step(&step_ctx, &mut step_execution, &mut step_status, mode)
            .await
        {
            Ok(surroundings) => surroundings,
            Err(e) => {
                self.mark_job_and_step_failed(&step_ctx, &mut step_status)
                    .await;
                return Err(BatchError::fatal(e));
            }
        };

        // Artifacts are in play from here on: a failing body still gets its
        // post-step artifacts invoked.
        let mut batchlet_exit = None;
        let body = async {
            self.invoke_pre_step(&mut surroundings).await?;
            self.invoke_core_step(
                &step_ctx,
                &mut step_execution,
                &mut step_status,
                &mut surroundings,
                mode,
                &mut batchlet_exit,
            )
            .await
        }
        .await;
        // Definition mistakes and bookkeeping failures still end the step
        // normally but are then reported to the caller.
        let mut escalate = None;
        if let Err(e) = body {
            tracing::warn!(
                step = %self.step.id,
                execution_id = self.job.execution_id,
                error = %e,
                "step body failed"
            );
            step_ctx.set_error(e.to_string());
            if e.is_fatal() || e.is_configuration_error() {
                escalate = Some(e);
            }
            if let Err(persist) = self.mark_step_failed(&step_ctx, &mut step_status).await {
                return Err(BatchError::fatal(persist));
            }
        }

        if let Err(e) = self.invoke_post_step(&step_ctx, &mut surroundings).await {
            tracing::warn!(step = %self.step.id, error = %e, "post-step artifacts failed");
            step_ctx.set_error(e.to_string());
            if let Err(persist) = self.mark_step_failed(&step_ctx, &mut step_status).await {
                return Err(BatchError::fatal(persist));
            }
        }

        if let Err(e) = self
            .end_step(&step_ctx, &mut step_execution, &mut step_status, batchlet_exit)
            .await
        {
            tracing::error!(
                step = %self.step.id,
                execution_id = self.job.execution_id,
                error = %e,
                "failure ending step execution, failing job"
            );
            self.mark_job_and_step_failed(&step_ctx, &mut step_status)
                .await;
            return Err(BatchError::fatal(e));
        }

        if let Some(e) = escalate {
            self.job.context.set_batch_status(BatchStatus::Failed);
            return Err(BatchError::fatal(e));
        }

        let extended = if step_status.batch_status == BatchStatus::Failed {
            ExtendedBatchStatus::ExceptionThrown
        } else {
            ExtendedBatchStatus::NormalCompletion
        };
        Ok(ElementOutcome {
            status: ExecutionStatus::new(extended, step_status.exit_status.clone()),
            step_executions: vec![step_execution],
        })
    }

    // -----------------------------------------------------------------------
    // Eligibility
    // -----------------------------------------------------------------------

    async fn should_step_be_executed(&self) -> Result<Eligibility, BatchError> {
        let persistence = &self.services().persistence;
        let instance_id = self.job.instance.instance_id;

        let Some(mut step_status) = persistence.get_step_status(instance_id, &self.step.id).await?
        else {
            let step_execution = persistence
                .create_step_execution(self.job.execution_id, &self.step.id)
                .await?;
            let step_status =
                StepStatus::new(instance_id, &self.step.id, step_execution.step_execution_id);
            persistence.save_step_status(&step_status).await?;
            return Ok(Eligibility::Run {
                step_execution,
                step_status,
                mode: StartMode::First,
            });
        };

        let mode = if step_status.batch_status == BatchStatus::Completed {
            if !self.step.allow_start_if_complete {
                return Ok(Eligibility::DoNotRun(step_status));
            }
            StartMode::Rerun
        } else {
            StartMode::Resume
        };

        let limit = self.step.start_limit;
        if limit < 0 {
            return Err(BatchError::NegativeStartLimit {
                step: self.step.id.clone(),
                limit,
            });
        }
        let attempt = step_status.start_count + 1;
        if limit > 0 && i64::from(attempt) > i64::from(limit) {
            return Err(BatchError::StartLimitExceeded {
                step: self.step.id.clone(),
                limit,
                attempt,
            });
        }

        step_status.start_count = attempt;
        let step_execution = persistence
            .create_step_execution(self.job.execution_id, &self.step.id)
            .await?;
        step_status.last_step_execution_id = step_execution.step_execution_id;
        tracing::info!(
            step = %self.step.id,
            instance_id,
            attempt,
            mode = ?mode,
            "restarting step"
        );
        Ok(Eligibility::Run {
            step_execution,
            step_status,
            mode,
        })
    }

    async fn do_not_run(&self, step_status: StepStatus) -> Result<ElementOutcome, BatchError> {
        tracing::info!(
            step = %self.step.id,
            exit_status = ?step_status.exit_status,
            "step already completed, not running it again"
        );
        let previous = self
            .services()
            .persistence
            .get_step_execution(step_status.last_step_execution_id)
            .await
            .map_err(BatchError::from)
            .map_err(BatchError::fatal)?;
        Ok(ElementOutcome {
            status: ExecutionStatus::new(ExtendedBatchStatus::DoNotRun, step_status.exit_status),
            step_executions: previous.into_iter().collect(),
        })
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    async fn start_step(
        &mut self,
        step_ctx: &Arc<StepContext>,
        step_execution: &mut StepExecution,
        step_status: &mut StepStatus,
        mode: StartMode,
    ) -> Result<Surroundings<'a>, BatchError> {
        let services = self.services();
        let persistence = &services.persistence;

        if mode != StartMode::First {
            step_ctx.restore_persistent_user_data(step_status.persistent_user_data.clone());
        }
        match mode {
            StartMode::Resume => step_ctx.set_metrics(step_status.committed_metrics),
            StartMode::Rerun => {
                CheckpointManager::new(
                    persistence.clone(),
                    self.job.instance.instance_id,
                    &self.step.id,
                )
                .clear()
                .await?;
                step_status.committed_metrics = StepMetrics::default();
                step_status.partition_count = None;
            }
            StartMode::First => {}
        }

        // STARTING
        step_status.batch_status = BatchStatus::Starting;
        step_ctx.set_batch_status(BatchStatus::Starting);
        persistence.save_step_status(step_status).await?;
        if let Some(mut job_status) = persistence
            .get_job_status(self.job.instance.instance_id)
            .await?
        {
            job_status.current_step = Some(self.step.id.clone());
            persistence.save_job_status(&job_status).await?;
        }

        let ctx = InjectionContext::for_step(self.job.context.clone(), step_ctx.clone());
        let step: &'a StepDefinition = self.step;
        let surroundings = match &step.partition {
            Some(partition) => Surroundings::Partitioned(PartitionCoordinator::new(
                self.kernel,
                self.job,
                step,
                partition,
                &ctx,
            )?),
            None => {
                let listeners = step
                    .listeners
                    .iter()
                    .map(|l| services.artifacts.create_step_listener(l, &ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some(sink) = self.sink.as_mut() {
                    sink.attach_collector(services.artifacts.as_ref(), &ctx)?;
                }
                Surroundings::Listeners(listeners)
            }
        };

        // STARTED
        step_status.batch_status = BatchStatus::Started;
        step_ctx.set_batch_status(BatchStatus::Started);
        persistence.save_step_status(step_status).await?;
        step_execution.batch_status = BatchStatus::Started;
        step_execution.start_time = Some(Utc::now());
        step_execution.metrics = step_ctx.metrics();
        persistence.update_step_execution(step_execution).await?;

        tracing::info!(
            step = %self.step.id,
            execution_id = self.job.execution_id,
            step_execution_id = step_execution.step_execution_id,
            "step started"
        );
        services.events.publish(BatchEvent::StepStarted {
            execution_id: self.job.execution_id,
            step_execution_id: step_execution.step_execution_id,
            step_name: self.step.id.clone(),
        });
        Ok(surroundings)
    }

    // -----------------------------------------------------------------------
    // Body
    // -----------------------------------------------------------------------

    async fn invoke_pre_step(&self, surroundings: &mut Surroundings<'a>) -> Result<(), BatchError> {
        match surroundings {
            Surroundings::Listeners(listeners) => {
                for listener in listeners.iter_mut() {
                    listener.before_step().await?;
                }
            }
            Surroundings::Partitioned(coordinator) => coordinator.begin().await?,
        }
        Ok(())
    }

    async fn invoke_core_step(
        &mut self,
        step_ctx: &Arc<StepContext>,
        step_execution: &mut StepExecution,
        step_status: &mut StepStatus,
        surroundings: &mut Surroundings<'a>,
        mode: StartMode,
        batchlet_exit: &mut Option<String>,
    ) -> Result<(), BatchError> {
        let services = self.services();

        if let Surroundings::Partitioned(coordinator) = surroundings {
            return coordinator.run(step_ctx, step_status, mode).await;
        }

        match &self.step.body {
            StepBody::Chunk(chunk) => {
                ChunkProcessor::new(services, self.job, step_ctx, chunk)
                    .run(step_execution, step_status, self.sink.as_mut())
                    .await
            }
            StepBody::Batchlet(artifact) => {
                if self.job.context.is_stop_requested() {
                    step_ctx.set_batch_status(BatchStatus::Stopping);
                    return Ok(());
                }
                let ctx = InjectionContext::for_step(self.job.context.clone(), step_ctx.clone());
                let mut batchlet = services.artifacts.create_batchlet(artifact, &ctx)?;
                *batchlet_exit = batchlet.process().await?;
                if self.job.context.is_stop_requested() {
                    step_ctx.set_batch_status(BatchStatus::Stopping);
                }
                if let Some(sink) = self.sink.as_mut() {
                    sink.collect().await?;
                }
                Ok(())
            }
        }
    }

    async fn invoke_post_step(
        &self,
        step_ctx: &Arc<StepContext>,
        surroundings: &mut Surroundings<'a>,
    ) -> Result<(), BatchError> {
        match surroundings {
            Surroundings::Listeners(listeners) => {
                for listener in listeners.iter_mut() {
                    listener.after_step().await?;
                }
            }
            Surroundings::Partitioned(coordinator) => {
                coordinator
                    .finish(step_ctx.batch_status() == BatchStatus::Failed)
                    .await?
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // End
    // -----------------------------------------------------------------------

    async fn end_step(
        &self,
        step_ctx: &Arc<StepContext>,
        step_execution: &mut StepExecution,
        step_status: &mut StepStatus,
        batchlet_exit: Option<String>,
    ) -> Result<(), BatchError> {
        let services = self.services();
        let persistence = &services.persistence;

        step_status.persistent_user_data = step_ctx.persistent_user_data();
        persistence.save_step_status(step_status).await?;

        let final_status = match step_ctx.batch_status() {
            BatchStatus::Started => BatchStatus::Completed,
            BatchStatus::Stopping => BatchStatus::Stopped,
            BatchStatus::Failed => BatchStatus::Failed,
            other => {
                return Err(BatchError::InternalConsistency(format!(
                    "step '{}' cannot end from status {other}",
                    self.step.id
                )));
            }
        };
        step_ctx.set_batch_status(final_status);
        step_status.batch_status = final_status;

        step_ctx.default_exit_status(batchlet_exit.unwrap_or_else(|| final_status.to_string()));
        step_status.exit_status = step_ctx.exit_status();
        persistence.save_step_status(step_status).await?;

        step_execution.batch_status = final_status;
        step_execution.exit_status = step_status.exit_status.clone();
        step_execution.end_time = Some(Utc::now());
        step_execution.metrics = step_ctx.metrics();
        step_execution.persistent_user_data = step_status.persistent_user_data.clone();
        persistence.update_step_execution(step_execution).await?;

        tracing::info!(
            step = %self.step.id,
            execution_id = self.job.execution_id,
            batch_status = %final_status,
            exit_status = ?step_status.exit_status,
            read = step_execution.metrics.read_count,
            written = step_execution.metrics.write_count,
            "step ended"
        );
        services.events.publish(BatchEvent::StepEnded {
            execution_id: self.job.execution_id,
            step_execution_id: step_execution.step_execution_id,
            step_name: self.step.id.clone(),
            batch_status: final_status,
            exit_status: step_status.exit_status.clone(),
        });
        Ok(())
    }

    async fn mark_step_failed(
        &self,
        step_ctx: &StepContext,
        step_status: &mut StepStatus,
    ) -> Result<(), BatchError> {
        step_ctx.set_batch_status(BatchStatus::Failed);
        step_status.batch_status = BatchStatus::Failed;
        self.services()
            .persistence
            .save_step_status(step_status)
            .await?;
        Ok(())
    }

    async fn mark_job_and_step_failed(&self, step_ctx: &StepContext, step_status: &mut StepStatus) {
        self.job.context.set_batch_status(BatchStatus::Failed);
        if let Err(e) = self.mark_step_failed(step_ctx, step_status).await {
            tracing::error!(
                step = %self.step.id,
                error = %e,
                "could not persist FAILED step status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use batchflow_types::error::ArtifactError;
    use batchflow_types::model::{ArtifactRef, ExecutionElement};
    use batchflow_types::status::BatchStatus;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use crate::artifact::Batchlet;
    use crate::engine::StepContext;
    use crate::error::BatchError;
    use crate::repository::PersistenceService;
    use crate::test_support::{
        Harness, batchlet_step, chunk_step, failing_script, job, numbers, script, step,
        written_numbers,
    };

    /// Bumps a counter in the step's persistent user data; fails on a fresh step.
    struct CountingBatchlet {
        step: Arc<StepContext>,
        seen: Arc<Mutex<Vec<Option<Value>>>>,
    }

    #[async_trait]
    impl Batchlet for CountingBatchlet {
        async fn process(&mut self) -> Result<Option<String>, ArtifactError> {
            let previous = self.step.persistent_user_data();
            self.seen.lock().push(previous.clone());
            let n = previous
                .as_ref()
                .and_then(|v| v["n"].as_u64())
                .unwrap_or(0);
            self.step.set_persistent_user_data(json!({ "n": n + 1 }));
            if previous.is_none() {
                return Err(ArtifactError::new("first_run", "fresh step"));
            }
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_batchlet_return_value_becomes_exit_status() {
        let harness = Harness::new();
        harness.register(job("exit", vec![step(batchlet_step("s", script("MY_EXIT")))]));

        let execution = harness.run("exit").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.as_deref(), Some("MY_EXIT"));

        let steps = harness
            .operator
            .get_step_executions(execution.execution_id)
            .await
            .unwrap();
        assert_eq!(steps[0].exit_status.as_deref(), Some("MY_EXIT"));
        assert!(steps[0].start_time.is_some());
        assert!(steps[0].end_time.is_some());
    }

    #[tokio::test]
    async fn test_start_limit_refuses_further_starts() {
        let harness = Harness::new();
        let mut definition = batchlet_step("s", failing_script());
        definition.start_limit = 2;
        harness.register(job("limited", vec![step(definition)]));

        let first = harness.run("limited").await.unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);
        let second = harness.restart(first.execution_id).await.unwrap();
        assert_eq!(second.batch_status, BatchStatus::Failed);

        let err = harness.restart(second.execution_id).await.unwrap_err();
        assert!(err.is_configuration_error());
        match err {
            BatchError::Fatal(inner) => assert!(matches!(
                *inner,
                BatchError::StartLimitExceeded {
                    limit: 2,
                    attempt: 3,
                    ..
                }
            )),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(harness.probes.batchlet_runs.load(Ordering::SeqCst), 2);

        let executions = harness
            .operator
            .get_job_executions(first.instance_id)
            .await
            .unwrap();
        assert_eq!(executions.len(), 3);
        assert_eq!(executions[2].batch_status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_negative_start_limit_is_reported_on_restart() {
        let harness = Harness::new();
        let mut definition = batchlet_step("s", failing_script());
        definition.start_limit = -1;
        harness.register(job("negative", vec![step(definition)]));

        let first = harness.run("negative").await.unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);
        let err = harness.restart(first.execution_id).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::Fatal(ref inner) if matches!(**inner, BatchError::NegativeStartLimit { limit: -1, .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_step_is_not_run_again() {
        let harness = Harness::new();
        let mut first_step = batchlet_step("a", script("A_DONE"));
        first_step.next = Some("b".to_string());
        let reader = numbers(2).with_property("crash_at", "0");
        harness.register(job(
            "twice",
            vec![step(first_step), step(chunk_step("b", reader, 1))],
        ));
        harness.probes.crash.store(true, Ordering::SeqCst);

        let first = harness.run("twice").await.unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);

        harness.probes.crash.store(false, Ordering::SeqCst);
        let second = harness.restart(first.execution_id).await.unwrap();
        assert_eq!(second.batch_status, BatchStatus::Completed);
        assert_eq!(harness.probes.batchlet_runs.load(Ordering::SeqCst), 1);
        assert_eq!(written_numbers(&harness.probes), vec![1, 2]);

        // Only the step that actually ran has an execution in the restart.
        let steps = harness
            .operator
            .get_step_executions(second.execution_id)
            .await
            .unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["b"]);

        let status = harness
            .persistence
            .get_step_status(first.instance_id, "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.batch_status, BatchStatus::Completed);
        assert_eq!(status.exit_status.as_deref(), Some("A_DONE"));
        assert_eq!(status.start_count, 1);
    }

    #[tokio::test]
    async fn test_completed_step_reruns_from_scratch_when_allowed() {
        let harness = Harness::new();
        let mut first_step = chunk_step("a", numbers(3), 2);
        first_step.allow_start_if_complete = true;
        first_step.next = Some("b".to_string());
        harness.register(job(
            "again",
            vec![step(first_step), step(batchlet_step("b", failing_script()))],
        ));

        let first = harness.run("again").await.unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);
        let second = harness.restart(first.execution_id).await.unwrap();
        assert_eq!(second.batch_status, BatchStatus::Failed);

        assert_eq!(written_numbers(&harness.probes), vec![1, 2, 3, 1, 2, 3]);
        let steps = harness
            .operator
            .get_step_executions(second.execution_id)
            .await
            .unwrap();
        assert_eq!(steps[0].step_name, "a");
        assert_eq!(steps[0].metrics.read_count, 3);
    }

    #[tokio::test]
    async fn test_listeners_surround_the_body_even_when_it_fails() {
        let harness = Harness::new();
        let mut definition = batchlet_step("s", failing_script());
        definition.listeners = vec![ArtifactRef::new("record")];
        harness.register(job("listened", vec![ExecutionElement::Step(definition)]));

        let execution = harness.run("listened").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert_eq!(
            *harness.probes.listener_events.lock(),
            vec!["before:s".to_string(), "after:s".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_the_job_with_a_named_error() {
        let harness = Harness::new();
        harness.register(job(
            "missing",
            vec![step(batchlet_step("s", ArtifactRef::new("nowhere")))],
        ));

        let execution_id = harness
            .operator
            .start("missing", Default::default())
            .await
            .unwrap();
        let err = harness.wait(execution_id).await.unwrap_err();
        assert!(err.is_configuration_error());

        let execution = harness
            .operator
            .get_job_execution(execution_id)
            .await
            .unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn test_persistent_user_data_survives_restart() {
        let harness = Harness::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            harness.artifacts.register_batchlet("counting", move |ctx| {
                let step = ctx
                    .step
                    .clone()
                    .ok_or_else(|| ArtifactError::new("scope", "needs a step"))?;
                Ok(Box::new(CountingBatchlet {
                    step,
                    seen: seen.clone(),
                }))
            });
        }
        harness.register(job(
            "count",
            vec![step(batchlet_step("c", ArtifactRef::new("counting")))],
        ));

        let first = harness.run("count").await.unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);
        let second = harness.restart(first.execution_id).await.unwrap();
        assert_eq!(second.batch_status, BatchStatus::Completed);

        assert_eq!(*seen.lock(), vec![None, Some(json!({ "n": 1 }))]);
        let status = harness
            .persistence
            .get_step_status(first.instance_id, "c")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.persistent_user_data, Some(json!({ "n": 2 })));
    }
}
