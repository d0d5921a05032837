//! Chunk-oriented step body: read, process, buffer, write, checkpoint.
//!
//! Items are read and processed one at a time and buffered until the
//! checkpoint algorithm ends the chunk. The buffer is then written and the
//! chunk committed: metrics, persistent user data and both stream positions
//! are persisted as one unit. A stop request is honoured between chunks only.

use std::sync::Arc;

use batchflow_types::error::ArtifactError;
use batchflow_types::event::BatchEvent;
use batchflow_types::execution::{CheckpointStream, StepExecution, StepStatus};
use batchflow_types::model::{CheckpointPolicy, ChunkDefinition};
use batchflow_types::status::BatchStatus;

use super::checkpoint::{CheckpointManager, ItemCheckpointAlgorithm};
use super::context::{InjectionContext, StepContext};
use super::job::RuntimeJob;
use super::partition::PartitionSink;
use super::services::ServiceContext;
use crate::artifact::{CheckpointAlgorithm, Item, ItemProcessor, ItemReader, ItemWriter};
use crate::error::BatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipPhase {
    Read,
    Process,
    Write,
}

impl SkipPhase {
    fn as_str(&self) -> &'static str {
        match self {
            SkipPhase::Read => "read",
            SkipPhase::Process => "process",
            SkipPhase::Write => "write",
        }
    }
}

struct ChunkArtifacts {
    reader: Box<dyn ItemReader>,
    processor: Option<Box<dyn ItemProcessor>>,
    writer: Box<dyn ItemWriter>,
    algorithm: Box<dyn CheckpointAlgorithm>,
}

/// Runs one chunk step to end of stream, a stop request, or the first
/// non-skippable error.
pub(crate) struct ChunkProcessor<'a> {
    services: &'a ServiceContext,
    job: &'a RuntimeJob,
    step_ctx: &'a Arc<StepContext>,
    chunk: &'a ChunkDefinition,
    checkpoints: CheckpointManager,
}

impl<'a> ChunkProcessor<'a> {
    pub(crate) fn new(
        services: &'a ServiceContext,
        job: &'a RuntimeJob,
        step_ctx: &'a Arc<StepContext>,
        chunk: &'a ChunkDefinition,
    ) -> Self {
        let checkpoints = CheckpointManager::new(
            services.persistence.clone(),
            job.instance.instance_id,
            step_ctx.step_name(),
        );
        Self {
            services,
            job,
            step_ctx,
            chunk,
            checkpoints,
        }
    }

    fn build_artifacts(&self) -> Result<ChunkArtifacts, BatchError> {
        let ctx = InjectionContext::for_step(self.job.context.clone(), self.step_ctx.clone());
        let factory = &self.services.artifacts;
        let reader = factory.create_reader(&self.chunk.reader, &ctx)?;
        let processor = self
            .chunk
            .processor
            .as_ref()
            .map(|p| factory.create_processor(p, &ctx))
            .transpose()?;
        let writer = factory.create_writer(&self.chunk.writer, &ctx)?;
        let algorithm: Box<dyn CheckpointAlgorithm> = match &self.chunk.checkpoint_policy {
            CheckpointPolicy::Item => {
                let defaults = &self.services.config.chunk;
                Box::new(ItemCheckpointAlgorithm::new(
                    self.chunk.item_count.unwrap_or(defaults.default_item_count),
                    self.chunk
                        .time_limit_secs
                        .unwrap_or(defaults.default_time_limit_secs),
                ))
            }
            CheckpointPolicy::Custom { algorithm } => {
                factory.create_checkpoint_algorithm(algorithm, &ctx)?
            }
        };
        Ok(ChunkArtifacts {
            reader,
            processor,
            writer,
            algorithm,
        })
    }

    pub(crate) async fn run(
        &self,
        step_execution: &mut StepExecution,
        step_status: &mut StepStatus,
        mut sink: Option<&mut PartitionSink>,
    ) -> Result<(), BatchError> {
        let mut artifacts = self.build_artifacts()?;

        let reader_checkpoint = self.checkpoints.load(CheckpointStream::Reader).await?;
        let writer_checkpoint = self.checkpoints.load(CheckpointStream::Writer).await?;
        artifacts.reader.open(reader_checkpoint).await?;
        if let Err(e) = artifacts.writer.open(writer_checkpoint).await {
            let _ = artifacts.reader.close().await;
            return Err(e.into());
        }

        let result = self
            .run_chunks(&mut artifacts, step_execution, step_status, &mut sink)
            .await;

        let reader_closed = artifacts.reader.close().await;
        let writer_closed = artifacts.writer.close().await;
        match result {
            Ok(()) => {
                reader_closed?;
                writer_closed?;
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = reader_closed.and(writer_closed) {
                    tracing::warn!(
                        step = %self.step_ctx.step_name(),
                        error = %close_err,
                        "close failed after chunk error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_chunks(
        &self,
        artifacts: &mut ChunkArtifacts,
        step_execution: &mut StepExecution,
        step_status: &mut StepStatus,
        sink: &mut Option<&mut PartitionSink>,
    ) -> Result<(), BatchError> {
        loop {
            if self.job.context.is_stop_requested() {
                tracing::info!(
                    step = %self.step_ctx.step_name(),
                    execution_id = self.job.execution_id,
                    "stop requested, ending chunk loop"
                );
                self.step_ctx.set_batch_status(BatchStatus::Stopping);
                return Ok(());
            }

            let end_of_stream = match self.run_one_chunk(artifacts).await {
                Ok(end_of_stream) => end_of_stream,
                Err(e) => {
                    self.rollback(step_execution).await;
                    return Err(e);
                }
            };

            if let Err(e) = self
                .commit(artifacts, step_execution, step_status)
                .await
            {
                self.rollback(step_execution).await;
                return Err(e);
            }

            if let Some(sink) = sink.as_deref_mut() {
                sink.collect().await?;
            }

            if end_of_stream {
                return Ok(());
            }
        }
    }

    /// Fill and write one chunk. Returns `true` once the reader is exhausted.
    async fn run_one_chunk(&self, artifacts: &mut ChunkArtifacts) -> Result<bool, BatchError> {
        artifacts.algorithm.begin_checkpoint();
        let mut buffer: Vec<Item> = Vec::new();
        let mut end_of_stream = false;

        loop {
            let item = match artifacts.reader.read_item().await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    end_of_stream = true;
                    break;
                }
                Err(e) => {
                    self.skip_or_fail(SkipPhase::Read, e)?;
                    continue;
                }
            };
            self.step_ctx.update_metrics(|m| m.read_count += 1);

            match &mut artifacts.processor {
                Some(processor) => match processor.process_item(item).await {
                    Ok(Some(processed)) => buffer.push(processed),
                    Ok(None) => self.step_ctx.update_metrics(|m| m.filter_count += 1),
                    Err(e) => self.skip_or_fail(SkipPhase::Process, e)?,
                },
                None => buffer.push(item),
            }

            if artifacts.algorithm.is_ready_to_checkpoint() {
                break;
            }
        }

        if !buffer.is_empty() {
            match artifacts.writer.write_items(&buffer).await {
                Ok(()) => {
                    let written = buffer.len() as u64;
                    self.step_ctx.update_metrics(|m| m.write_count += written);
                }
                Err(e) => self.skip_or_fail(SkipPhase::Write, e)?,
            }
        }
        Ok(end_of_stream)
    }

    fn skip_or_fail(&self, phase: SkipPhase, err: ArtifactError) -> Result<(), BatchError> {
        if !self.chunk.skippable.matches(&err.kind) {
            return Err(err.into());
        }
        let skipped = self.step_ctx.metrics().skip_count();
        if let Some(limit) = self.chunk.skip_limit {
            if skipped >= u64::from(limit) {
                return Err(BatchError::SkipLimitExceeded {
                    step: self.step_ctx.step_name().to_string(),
                    limit,
                    source: err,
                });
            }
        }
        self.step_ctx.update_metrics(|m| match phase {
            SkipPhase::Read => m.read_skip_count += 1,
            SkipPhase::Process => m.process_skip_count += 1,
            SkipPhase::Write => m.write_skip_count += 1,
        });
        tracing::warn!(
            step = %self.step_ctx.step_name(),
            phase = phase.as_str(),
            kind = %err.kind,
            error = %err.message,
            "skipped item"
        );
        Ok(())
    }

    async fn commit(
        &self,
        artifacts: &mut ChunkArtifacts,
        step_execution: &mut StepExecution,
        step_status: &mut StepStatus,
    ) -> Result<(), BatchError> {
        let reader_position = artifacts.reader.checkpoint_info().await?;
        let writer_position = artifacts.writer.checkpoint_info().await?;

        self.step_ctx.update_metrics(|m| m.commit_count += 1);
        let metrics = self.step_ctx.metrics();
        let user_data = self.step_ctx.persistent_user_data();

        step_execution.metrics = metrics;
        step_execution.persistent_user_data = user_data.clone();
        step_status.committed_metrics = metrics;
        step_status.persistent_user_data = user_data;

        self.checkpoints
            .commit(step_execution, step_status, reader_position, writer_position)
            .await?;
        artifacts.algorithm.end_checkpoint();

        self.services.events.publish(BatchEvent::ChunkCommitted {
            step_execution_id: step_execution.step_execution_id,
            step_name: step_execution.step_name.clone(),
            metrics,
        });
        Ok(())
    }

    /// Count the rollback and record it on the step execution, best effort.
    async fn rollback(&self, step_execution: &mut StepExecution) {
        self.step_ctx.update_metrics(|m| m.rollback_count += 1);
        step_execution.metrics = self.step_ctx.metrics();
        tracing::debug!(
            step = %self.step_ctx.step_name(),
            rollbacks = step_execution.metrics.rollback_count,
            "rolled back chunk"
        );
        if let Err(e) = self
            .services
            .persistence
            .update_step_execution(step_execution)
            .await
        {
            tracing::warn!(
                step = %self.step_ctx.step_name(),
                error = %e,
                "could not record rollback"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use batchflow_types::error::ArtifactError;
    use batchflow_types::execution::Properties;
    use batchflow_types::model::{ArtifactRef, CheckpointPolicy, ErrorClassifier, StepBody};
    use batchflow_types::status::BatchStatus;
    use parking_lot::Mutex;
    use serde_json::Value;

    use crate::artifact::{CheckpointAlgorithm, ItemWriter};
    use crate::engine::InjectionContext;
    use crate::test_support::{Harness, chunk_step, job, numbers, step, written_numbers};

    /// Checkpoints after every `n` items.
    struct EveryN {
        n: usize,
        seen: usize,
    }

    impl CheckpointAlgorithm for EveryN {
        fn begin_checkpoint(&mut self) {
            self.seen = 0;
        }

        fn is_ready_to_checkpoint(&mut self) -> bool {
            self.seen += 1;
            self.seen >= self.n
        }
    }

    /// Holds its second write until the job is asked to stop while `gate` is set.
    struct GatedWriter {
        ctx: InjectionContext,
        gate: Arc<AtomicBool>,
        held: Arc<AtomicBool>,
        written: Arc<Mutex<Vec<u64>>>,
        writes: usize,
    }

    #[async_trait]
    impl ItemWriter for GatedWriter {
        async fn write_items(&mut self, items: &[Value]) -> Result<(), ArtifactError> {
            self.written
                .lock()
                .extend(items.iter().filter_map(Value::as_u64));
            self.writes += 1;
            if self.writes == 2 && self.gate.load(Ordering::SeqCst) {
                self.held.store(true, Ordering::SeqCst);
                while !self.ctx.is_stop_requested() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            Ok(())
        }
    }

    fn with_chunk(
        mut definition: batchflow_types::model::StepDefinition,
        f: impl FnOnce(&mut batchflow_types::model::ChunkDefinition),
    ) -> batchflow_types::model::StepDefinition {
        if let StepBody::Chunk(chunk) = &mut definition.body {
            f(chunk);
        }
        definition
    }

    #[tokio::test]
    async fn test_commits_every_item_count_items() {
        let harness = Harness::new();
        harness.register(job("load", vec![step(chunk_step("s", numbers(5), 2))]));

        let execution = harness.run("load").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(*harness.probes.chunks.lock(), vec![2, 2, 1]);

        let steps = harness
            .operator
            .get_step_executions(execution.execution_id)
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        let metrics = steps[0].metrics;
        assert_eq!(metrics.read_count, 5);
        assert_eq!(metrics.write_count, 5);
        assert_eq!(metrics.commit_count, 3);
        assert_eq!(metrics.rollback_count, 0);
        assert_eq!(steps[0].exit_status.as_deref(), Some("COMPLETED"));
    }

    #[tokio::test]
    async fn test_restart_resumes_from_last_checkpoint() {
        let harness = Harness::new();
        let reader = numbers(5).with_property("crash_at", "4");
        harness.register(job("resume", vec![step(chunk_step("s", reader, 2))]));
        harness.probes.crash.store(true, Ordering::SeqCst);

        let first = harness.run("resume").await.unwrap();
        assert_eq!(first.batch_status, BatchStatus::Failed);
        assert_eq!(written_numbers(&harness.probes), vec![1, 2, 3, 4]);

        harness.probes.crash.store(false, Ordering::SeqCst);
        let second = harness.restart(first.execution_id).await.unwrap();
        assert_eq!(second.batch_status, BatchStatus::Completed);
        assert_eq!(second.instance_id, first.instance_id);

        // Nothing committed before the crash is read or written again.
        assert_eq!(written_numbers(&harness.probes), vec![1, 2, 3, 4, 5]);
        assert_eq!(harness.probes.reads.load(Ordering::SeqCst), 5);

        let steps = harness
            .operator
            .get_step_executions(second.execution_id)
            .await
            .unwrap();
        assert_eq!(steps[0].metrics.read_count, 5);
        assert_eq!(steps[0].metrics.write_count, 5);
        assert_eq!(steps[0].batch_status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_filtered_items_are_counted_not_written() {
        let harness = Harness::new();
        let definition = with_chunk(chunk_step("s", numbers(6), 3), |chunk| {
            chunk.processor = Some(ArtifactRef::new("odd"));
        });
        harness.register(job("filter", vec![step(definition)]));

        let execution = harness.run("filter").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(written_numbers(&harness.probes), vec![1, 3, 5]);

        let steps = harness
            .operator
            .get_step_executions(execution.execution_id)
            .await
            .unwrap();
        assert_eq!(steps[0].metrics.filter_count, 3);
        assert_eq!(steps[0].metrics.read_count, 6);
        assert_eq!(steps[0].metrics.write_count, 3);
    }

    #[tokio::test]
    async fn test_skippable_read_errors_are_skipped() {
        let harness = Harness::new();
        let reader = numbers(5).with_property("failing", "1,3");
        let definition = with_chunk(chunk_step("s", reader, 10), |chunk| {
            chunk.skippable = ErrorClassifier {
                include: vec!["bad_record".to_string()],
                exclude: Vec::new(),
            };
            chunk.skip_limit = Some(2);
        });
        harness.register(job("skip", vec![step(definition)]));

        let execution = harness.run("skip").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(written_numbers(&harness.probes), vec![1, 3, 5]);

        let steps = harness
            .operator
            .get_step_executions(execution.execution_id)
            .await
            .unwrap();
        assert_eq!(steps[0].metrics.read_skip_count, 2);
    }

    #[tokio::test]
    async fn test_exhausting_skip_limit_fails_the_step() {
        let harness = Harness::new();
        let reader = numbers(5).with_property("failing", "0,1,2");
        let definition = with_chunk(chunk_step("s", reader, 10), |chunk| {
            chunk.skippable.include = vec!["*".to_string()];
            chunk.skip_limit = Some(2);
        });
        harness.register(job("limit", vec![step(definition)]));

        let execution = harness.run("limit").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Failed);
        assert!(harness.probes.written.lock().is_empty());

        let steps = harness
            .operator
            .get_step_executions(execution.execution_id)
            .await
            .unwrap();
        assert_eq!(steps[0].batch_status, BatchStatus::Failed);
        assert_eq!(steps[0].metrics.rollback_count, 1);
    }

    #[tokio::test]
    async fn test_excluded_kinds_are_not_skipped() {
        let harness = Harness::new();
        let definition = with_chunk(
            chunk_step("s", ArtifactRef::new("numbers"), 2),
            |chunk| {
                chunk.processor = Some(ArtifactRef::new("odd").with_property("failing", "3"));
                chunk.skippable = ErrorClassifier {
                    include: vec!["*".to_string()],
                    exclude: vec!["bad_item".to_string()],
                };
            },
        );
        harness.register(job("exclude", vec![step(definition)]));

        let execution = harness.run("exclude").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Failed);
        // First chunk (1, 2) committed; item 3 failed the second.
        assert_eq!(written_numbers(&harness.probes), vec![1]);
    }

    #[tokio::test]
    async fn test_custom_checkpoint_algorithm_sets_chunk_boundaries() {
        let harness = Harness::new();
        harness
            .artifacts
            .register_checkpoint_algorithm("every", |ctx| {
                let n = ctx.property("n").and_then(|n| n.parse().ok()).unwrap_or(1);
                Ok(Box::new(EveryN { n, seen: 0 }))
            });
        let definition = with_chunk(chunk_step("s", numbers(7), 100), |chunk| {
            chunk.checkpoint_policy = CheckpointPolicy::Custom {
                algorithm: ArtifactRef::new("every").with_property("n", "3"),
            };
        });
        harness.register(job("custom", vec![step(definition)]));

        let execution = harness.run("custom").await.unwrap();
        assert_eq!(execution.batch_status, BatchStatus::Completed);
        assert_eq!(*harness.probes.chunks.lock(), vec![3, 3, 1]);
        assert_eq!(written_numbers(&harness.probes), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_stop_ends_between_chunks_and_restart_resumes() {
        let harness = Harness::new();
        let gate = Arc::new(AtomicBool::new(true));
        let held = Arc::new(AtomicBool::new(false));
        let written = Arc::new(Mutex::new(Vec::new()));
        {
            let (gate, held, written) = (gate.clone(), held.clone(), written.clone());
            harness.artifacts.register_writer("gated", move |ctx| {
                Ok(Box::new(GatedWriter {
                    ctx: ctx.clone(),
                    gate: gate.clone(),
                    held: held.clone(),
                    written: written.clone(),
                    writes: 0,
                }))
            });
        }
        let definition = with_chunk(chunk_step("s", numbers(10), 2), |chunk| {
            chunk.writer = ArtifactRef::new("gated");
        });
        harness.register(job("gated", vec![step(definition)]));

        let id = harness.operator.start("gated", Properties::new()).await.unwrap();
        while !held.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        harness.operator.stop(id).await.unwrap();
        let stopped = harness.wait(id).await.unwrap();
        assert_eq!(stopped.batch_status, BatchStatus::Stopped);
        assert_eq!(*written.lock(), vec![1, 2, 3, 4]);

        gate.store(false, Ordering::SeqCst);
        let resumed = harness.restart(id).await.unwrap();
        assert_eq!(resumed.batch_status, BatchStatus::Completed);
        assert_eq!(*written.lock(), (1..=10).collect::<Vec<u64>>());
    }
}
