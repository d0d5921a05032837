//! Partitioned step execution.
//!
//! The coordinator obtains a plan (static or from a mapper), turns every
//! partition into a sub-job whose single element is the step without its
//! partition block, and submits at most `threads` of them at once to the
//! pool. Partitions report back over a bounded channel: collector data as it
//! is produced and one final status each. The analyzer only ever runs on the
//! coordinator, in the order messages arrive.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use batchflow_types::event::BatchEvent;
use batchflow_types::execution::{Properties, StepStatus};
use batchflow_types::model::{
    ArtifactRef, ExecutionElement, JobDefinition, PartitionDefinition, PartitionPlan,
    PartitionPlanSource, StepDefinition,
};
use batchflow_types::status::BatchStatus;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::context::{InjectionContext, StepContext};
use super::job::{RuntimeJob, RuntimeKind};
use super::kernel::{BatchKernel, SubJob};
use super::step::{StartMode, StepController};
use crate::artifact::{
    ArtifactFactory, PartitionAnalyzer, PartitionCollector, PartitionReducer, PartitionStatus,
};
use crate::error::BatchError;

/// What a partition sends to its coordinator.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PartitionMessage {
    Collector {
        partition: u32,
        data: Value,
    },
    Status {
        partition: u32,
        batch_status: BatchStatus,
        exit_status: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Partition side
// ---------------------------------------------------------------------------

/// The partition's end of the coordinator channel.
pub(crate) struct PartitionSink {
    partition: u32,
    tx: mpsc::Sender<PartitionMessage>,
    collector_ref: Option<ArtifactRef>,
    collector: Option<Box<dyn PartitionCollector>>,
}

impl PartitionSink {
    pub(crate) fn new(
        partition: u32,
        tx: mpsc::Sender<PartitionMessage>,
        collector_ref: Option<ArtifactRef>,
    ) -> Self {
        Self {
            partition,
            tx,
            collector_ref,
            collector: None,
        }
    }

    /// Build the collector once the partition's step context exists.
    pub(crate) fn attach_collector(
        &mut self,
        factory: &dyn ArtifactFactory,
        ctx: &InjectionContext,
    ) -> Result<(), BatchError> {
        if let Some(reference) = &self.collector_ref {
            self.collector = Some(factory.create_partition_collector(reference, ctx)?);
        }
        Ok(())
    }

    /// Ask the collector for data and forward it. No-op without a collector.
    pub(crate) async fn collect(&mut self) -> Result<(), BatchError> {
        let Some(collector) = self.collector.as_mut() else {
            return Ok(());
        };
        if let Some(data) = collector.collect_partition_data().await? {
            self.send(PartitionMessage::Collector {
                partition: self.partition,
                data,
            })
            .await;
        }
        Ok(())
    }

    async fn send(&self, message: PartitionMessage) {
        if self.tx.send(message).await.is_err() {
            tracing::debug!(
                partition = self.partition,
                "coordinator gone, dropping partition message"
            );
        }
    }
}

struct PartitionUnit {
    index: u32,
    job: Arc<RuntimeJob>,
    collector: Option<ArtifactRef>,
}

/// Body of one partition work unit. Always reports a final status.
async fn run_partition(
    kernel: Arc<BatchKernel>,
    unit: PartitionUnit,
    tx: mpsc::Sender<PartitionMessage>,
) {
    let index = unit.index;
    let result = AssertUnwindSafe(execute_partition(&kernel, &unit, tx.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(BatchError::from_panic(payload)));
    let (batch_status, exit_status) = match result {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(
                partition = index,
                execution_id = unit.job.execution_id,
                error = %e,
                "partition failed"
            );
            let failed = Some(BatchStatus::Failed.to_string());
            if let Err(persist) = kernel
                .services()
                .persistence
                .update_execution_final(unit.job.execution_id, BatchStatus::Failed, failed.as_deref())
                .await
            {
                tracing::warn!(partition = index, error = %persist, "could not persist partition failure");
            }
            (BatchStatus::Failed, failed)
        }
    };
    let _ = tx
        .send(PartitionMessage::Status {
            partition: index,
            batch_status,
            exit_status,
        })
        .await;
}

async fn execute_partition(
    kernel: &Arc<BatchKernel>,
    unit: &PartitionUnit,
    tx: mpsc::Sender<PartitionMessage>,
) -> Result<(BatchStatus, Option<String>), BatchError> {
    let services = kernel.services();
    let job = &unit.job;
    services
        .persistence
        .mark_execution_started(job.execution_id)
        .await?;
    job.context.set_batch_status(BatchStatus::Started);

    let Some(ExecutionElement::Step(step)) = job.definition.elements.first() else {
        return Err(BatchError::InternalConsistency(format!(
            "partition job '{}' has no step",
            job.context.job_name()
        )));
    };
    let sink = PartitionSink::new(unit.index, tx, unit.collector.clone());
    let outcome = StepController::new(kernel, job, step, Some(sink))
        .execute()
        .await?;

    let batch_status = if job.context.batch_status() == BatchStatus::Failed {
        BatchStatus::Failed
    } else {
        outcome
            .step_executions
            .last()
            .map(|s| s.batch_status)
            .unwrap_or(BatchStatus::Completed)
    };
    let exit_status = outcome
        .status
        .exit_status
        .clone()
        .or_else(|| Some(batch_status.to_string()));

    job.context.set_batch_status(batch_status);
    services
        .persistence
        .update_execution_final(job.execution_id, batch_status, exit_status.as_deref())
        .await?;
    if let Some(mut status) = services
        .persistence
        .get_job_status(job.instance.instance_id)
        .await?
    {
        status.batch_status = Some(batch_status);
        status.exit_status = exit_status.clone();
        services.persistence.save_job_status(&status).await?;
    }
    Ok((batch_status, exit_status))
}

// ---------------------------------------------------------------------------
// Coordinator side
// ---------------------------------------------------------------------------

/// Drives the partitions of one step execution.
pub(crate) struct PartitionCoordinator<'a> {
    kernel: &'a Arc<BatchKernel>,
    job: &'a Arc<RuntimeJob>,
    step: &'a StepDefinition,
    partition: &'a PartitionDefinition,
    ctx: InjectionContext,
    reducer: Option<Box<dyn PartitionReducer>>,
    analyzer: Option<Box<dyn PartitionAnalyzer>>,
}

impl<'a> PartitionCoordinator<'a> {
    pub(crate) fn new(
        kernel: &'a Arc<BatchKernel>,
        job: &'a Arc<RuntimeJob>,
        step: &'a StepDefinition,
        partition: &'a PartitionDefinition,
        ctx: &InjectionContext,
    ) -> Result<Self, BatchError> {
        let factory = &kernel.services().artifacts;
        let reducer = partition
            .reducer
            .as_ref()
            .map(|r| factory.create_partition_reducer(r, ctx))
            .transpose()?;
        let analyzer = partition
            .analyzer
            .as_ref()
            .map(|a| factory.create_partition_analyzer(a, ctx))
            .transpose()?;
        Ok(Self {
            kernel,
            job,
            step,
            partition,
            ctx: ctx.clone(),
            reducer,
            analyzer,
        })
    }

    pub(crate) async fn begin(&mut self) -> Result<(), BatchError> {
        if let Some(reducer) = self.reducer.as_mut() {
            reducer.begin_partitioned_step().await?;
        }
        Ok(())
    }

    pub(crate) async fn finish(&mut self, failed: bool) -> Result<(), BatchError> {
        let Some(reducer) = self.reducer.as_mut() else {
            return Ok(());
        };
        if failed {
            reducer.rollback_partitioned_step().await?;
            reducer
                .after_partitioned_step_completion(PartitionStatus::Rollback)
                .await?;
        } else {
            reducer.before_partitioned_step_completion().await?;
            reducer
                .after_partitioned_step_completion(PartitionStatus::Commit)
                .await?;
        }
        Ok(())
    }

    async fn plan(&self) -> Result<PartitionPlan, BatchError> {
        match &self.partition.plan {
            PartitionPlanSource::Static(plan) => Ok(plan.clone()),
            PartitionPlanSource::Mapper { mapper } => {
                let mut mapper = self
                    .kernel
                    .services()
                    .artifacts
                    .create_partition_mapper(mapper, &self.ctx)?;
                Ok(mapper.map_partitions().await?)
            }
        }
    }

    /// The definition each partition runs: the bare step with the
    /// partition's own properties layered over the step's.
    fn partition_definition(&self, index: u32, properties: Properties) -> JobDefinition {
        let mut step = self.step.without_partition();
        step.properties.extend(properties);
        JobDefinition {
            id: format!("{}:{}:{}", self.job.instance.instance_id, self.step.id, index),
            restartable: true,
            properties: self.job.definition.properties.clone(),
            listeners: Vec::new(),
            elements: vec![ExecutionElement::Step(step)],
        }
    }

    pub(crate) async fn run(
        &mut self,
        step_ctx: &Arc<StepContext>,
        step_status: &mut StepStatus,
        mode: StartMode,
    ) -> Result<(), BatchError> {
        let services = self.kernel.services();
        let mut plan = self.plan().await?;

        // A restart keeps the partition layout of the first run so that the
        // same sub-jobs resume from their own checkpoints.
        if mode == StartMode::Resume {
            if let Some(count) = step_status.partition_count {
                plan.partitions = count;
            }
        }
        if plan.partitions == 0 {
            return Err(BatchError::InvalidDefinition(format!(
                "step '{}' mapped to zero partitions",
                self.step.id
            )));
        }
        step_status.partition_count = Some(plan.partitions);
        services.persistence.save_step_status(step_status).await?;

        let stop = self.job.context.stop_token().child_token();
        let capacity = services
            .config
            .partition
            .queue_capacity
            .unwrap_or(plan.partitions as usize)
            .max(1);
        let (tx, mut rx) = mpsc::channel(capacity);

        let mut pending = VecDeque::new();
        for index in 0..plan.partitions {
            let definition = self.partition_definition(index, plan.properties_for(index));
            let built = self
                .kernel
                .build_sub_job(
                    self.job,
                    definition,
                    RuntimeKind::Partition { index },
                    mode == StartMode::Rerun,
                    &stop,
                )
                .await?;
            match built {
                SubJob::Run(job) => pending.push_back(PartitionUnit {
                    index,
                    job,
                    collector: self.partition.collector.clone(),
                }),
                SubJob::AlreadyCompleted { .. } => {
                    tracing::debug!(step = %self.step.id, partition = index, "partition already completed");
                }
            }
        }

        let expected = pending.len() as u32;
        let threads = plan.effective_threads() as usize;
        tracing::info!(
            step = %self.step.id,
            partitions = plan.partitions,
            to_run = expected,
            threads,
            "starting partitions"
        );

        for _ in 0..threads {
            self.submit(&mut pending, &tx);
        }

        let timeout = Duration::from_secs(services.config.partition.wait_timeout_secs);
        let mut received = 0u32;
        let mut failed = 0u32;
        let mut stopped = false;
        let mut analyzer_error = None;

        while received < expected {
            let message = match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(_) => {
                    stop.cancel();
                    return Err(BatchError::PartitionTimeout {
                        step: self.step.id.clone(),
                        received,
                        expected,
                    });
                }
            };
            match message {
                PartitionMessage::Collector { data, .. } => {
                    if let Some(analyzer) = self.analyzer.as_mut() {
                        if let Err(e) = analyzer.analyze_collector_data(data).await {
                            analyzer_error.get_or_insert(e);
                        }
                    }
                }
                PartitionMessage::Status {
                    partition,
                    batch_status,
                    exit_status,
                } => {
                    received += 1;
                    match batch_status {
                        BatchStatus::Failed => failed += 1,
                        BatchStatus::Stopped => stopped = true,
                        _ => {}
                    }
                    services.events.publish(BatchEvent::PartitionReported {
                        step_name: self.step.id.clone(),
                        partition,
                        batch_status,
                    });
                    if let Some(analyzer) = self.analyzer.as_mut() {
                        if let Err(e) = analyzer.analyze_status(batch_status, exit_status).await {
                            analyzer_error.get_or_insert(e);
                        }
                    }
                    self.submit(&mut pending, &tx);
                }
            }
        }

        if let Some(e) = analyzer_error {
            return Err(e.into());
        }
        if received < expected {
            return Err(BatchError::InternalConsistency(format!(
                "partition channel of step '{}' closed after {received} of {expected} partitions",
                self.step.id
            )));
        }
        if failed > 0 {
            return Err(BatchError::PartitionFailed {
                step: self.step.id.clone(),
                failed,
            });
        }
        if stopped || self.job.context.is_stop_requested() {
            step_ctx.set_batch_status(BatchStatus::Stopping);
        }
        Ok(())
    }

    fn submit(&self, pending: &mut VecDeque<PartitionUnit>, tx: &mpsc::Sender<PartitionMessage>) {
        if let Some(unit) = pending.pop_front() {
            let kernel = self.kernel.clone();
            let tx = tx.clone();
            self.kernel
                .services()
                .pool
                .execute_parallel_task(Box::pin(run_partition(kernel, unit, tx)));
        }
    }
}
