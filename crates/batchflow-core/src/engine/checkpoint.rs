//! Chunk checkpointing: the built-in item/time algorithm and the manager
//! that persists checkpoint data and committed metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use batchflow_types::execution::{
    CheckpointDataKey, CheckpointStream, ChunkCommit, StepExecution, StepStatus,
};
use serde_json::Value;

use crate::artifact::CheckpointAlgorithm;
use crate::error::BatchError;
use crate::repository::PersistenceService;

// ---------------------------------------------------------------------------
// ItemCheckpointAlgorithm
// ---------------------------------------------------------------------------

/// Ends a chunk after `item_count` items or `time_limit` since the chunk
/// began, whichever comes first. A zero threshold disables that policy.
#[derive(Debug)]
pub struct ItemCheckpointAlgorithm {
    item_count: u32,
    time_limit: Duration,
    items_in_chunk: u32,
    chunk_started: Instant,
}

impl ItemCheckpointAlgorithm {
    pub fn new(item_count: u32, time_limit_secs: u32) -> Self {
        Self {
            item_count,
            time_limit: Duration::from_secs(u64::from(time_limit_secs)),
            items_in_chunk: 0,
            chunk_started: Instant::now(),
        }
    }
}

impl CheckpointAlgorithm for ItemCheckpointAlgorithm {
    fn begin_checkpoint(&mut self) {
        self.items_in_chunk = 0;
        self.chunk_started = Instant::now();
    }

    fn is_ready_to_checkpoint(&mut self) -> bool {
        self.items_in_chunk += 1;
        let by_count = self.item_count > 0 && self.items_in_chunk >= self.item_count;
        let by_time = !self.time_limit.is_zero() && self.chunk_started.elapsed() >= self.time_limit;
        by_count || by_time
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Reads and writes the checkpoint records of one step of one job instance.
///
/// Every chunk commit goes through [`CheckpointManager::commit`], which
/// persists metrics, step status and both stream positions as one unit.
pub struct CheckpointManager {
    persistence: Arc<dyn PersistenceService>,
    instance_id: i64,
    step_name: String,
}

impl CheckpointManager {
    pub fn new(
        persistence: Arc<dyn PersistenceService>,
        instance_id: i64,
        step_name: impl Into<String>,
    ) -> Self {
        Self {
            persistence,
            instance_id,
            step_name: step_name.into(),
        }
    }

    fn key(&self, stream: CheckpointStream) -> CheckpointDataKey {
        CheckpointDataKey::new(self.instance_id, self.step_name.clone(), stream)
    }

    /// Last committed position of a stream.
    pub async fn load(&self, stream: CheckpointStream) -> Result<Option<Value>, BatchError> {
        let key = self.key(stream);
        let value = self.persistence.get_checkpoint(&key).await?;
        tracing::debug!(
            checkpoint = %key,
            found = value.is_some(),
            "loaded checkpoint"
        );
        Ok(value)
    }

    /// Persist one chunk boundary.
    pub async fn commit(
        &self,
        step_execution: &StepExecution,
        step_status: &StepStatus,
        reader: Option<Value>,
        writer: Option<Value>,
    ) -> Result<(), BatchError> {
        let commit = ChunkCommit {
            step_execution: step_execution.clone(),
            step_status: step_status.clone(),
            reader_checkpoint: reader.map(|v| (self.key(CheckpointStream::Reader), v)),
            writer_checkpoint: writer.map(|v| (self.key(CheckpointStream::Writer), v)),
        };
        self.persistence.commit_chunk(&commit).await?;

        tracing::debug!(
            instance_id = self.instance_id,
            step = %self.step_name,
            step_execution_id = step_execution.step_execution_id,
            read = step_execution.metrics.read_count,
            written = step_execution.metrics.write_count,
            commits = step_execution.metrics.commit_count,
            "checkpointed chunk"
        );
        Ok(())
    }

    /// Drop both stream positions so the next run starts from scratch.
    pub async fn clear(&self) -> Result<(), BatchError> {
        self.persistence
            .delete_checkpoints(self.instance_id, &self.step_name)
            .await?;
        tracing::debug!(
            instance_id = self.instance_id,
            step = %self.step_name,
            "cleared checkpoints"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryPersistence;
    use batchflow_types::execution::Properties;

    #[test]
    fn test_item_threshold_ends_chunk() {
        let mut algorithm = ItemCheckpointAlgorithm::new(3, 0);
        algorithm.begin_checkpoint();
        assert!(!algorithm.is_ready_to_checkpoint());
        assert!(!algorithm.is_ready_to_checkpoint());
        assert!(algorithm.is_ready_to_checkpoint());

        algorithm.begin_checkpoint();
        assert!(!algorithm.is_ready_to_checkpoint());
    }

    #[test]
    fn test_time_threshold_ends_chunk() {
        let mut algorithm = ItemCheckpointAlgorithm::new(0, 1);
        algorithm.begin_checkpoint();
        assert!(!algorithm.is_ready_to_checkpoint());
        algorithm.chunk_started = Instant::now() - Duration::from_secs(2);
        assert!(algorithm.is_ready_to_checkpoint());
    }

    #[test]
    fn test_zero_thresholds_never_end_chunk() {
        let mut algorithm = ItemCheckpointAlgorithm::new(0, 0);
        algorithm.begin_checkpoint();
        for _ in 0..100 {
            assert!(!algorithm.is_ready_to_checkpoint());
        }
    }

    #[tokio::test]
    async fn test_commit_then_load_and_clear() {
        let store = Arc::new(InMemoryPersistence::new());
        let instance = store
            .create_job_instance("job", "default", "{}", None)
            .await
            .unwrap();
        let exec = store
            .create_job_execution(instance.instance_id, &Properties::new())
            .await
            .unwrap();
        let step = store
            .create_step_execution(exec.execution_id, "load")
            .await
            .unwrap();
        let status = StepStatus::new(instance.instance_id, "load", step.step_execution_id);

        let manager = CheckpointManager::new(store.clone(), instance.instance_id, "load");
        manager
            .commit(&step, &status, Some(serde_json::json!(4)), Some(serde_json::json!("w")))
            .await
            .unwrap();
        assert_eq!(
            manager.load(CheckpointStream::Reader).await.unwrap(),
            Some(serde_json::json!(4))
        );
        assert_eq!(
            manager.load(CheckpointStream::Writer).await.unwrap(),
            Some(serde_json::json!("w"))
        );

        manager.clear().await.unwrap();
        assert_eq!(manager.load(CheckpointStream::Reader).await.unwrap(), None);
    }
}
