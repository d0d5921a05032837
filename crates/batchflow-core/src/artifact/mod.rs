//! Pluggable user artifacts.
//!
//! One trait per artifact kind. The engine never interprets the business
//! logic behind them; it only drives their lifecycle. Artifacts are built per
//! step execution by an [`ArtifactFactory`] from a reference name and an
//! explicit [`InjectionContext`](crate::engine::context::InjectionContext).

pub mod registry;

use async_trait::async_trait;
use batchflow_types::error::ArtifactError;
use batchflow_types::execution::StepExecution;
use batchflow_types::model::PartitionPlan;
use batchflow_types::status::BatchStatus;
use serde_json::Value;

pub use registry::{ArtifactFactory, ArtifactRegistry};

/// A unit of data flowing through a chunk step.
pub type Item = Value;

// ---------------------------------------------------------------------------
// Chunk artifacts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ItemReader: Send + Sync {
    /// Position the reader; `checkpoint` is the last committed position.
    async fn open(&mut self, _checkpoint: Option<Value>) -> Result<(), ArtifactError> {
        Ok(())
    }

    /// Next item, or `None` at end of stream.
    async fn read_item(&mut self) -> Result<Option<Item>, ArtifactError>;

    /// Current position, persisted at every chunk commit.
    async fn checkpoint_info(&mut self) -> Result<Option<Value>, ArtifactError> {
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Transform an item; `None` filters it out of the chunk.
    async fn process_item(&mut self, item: Item) -> Result<Option<Item>, ArtifactError>;
}

#[async_trait]
pub trait ItemWriter: Send + Sync {
    async fn open(&mut self, _checkpoint: Option<Value>) -> Result<(), ArtifactError> {
        Ok(())
    }

    async fn write_items(&mut self, items: &[Item]) -> Result<(), ArtifactError>;

    async fn checkpoint_info(&mut self) -> Result<Option<Value>, ArtifactError> {
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

/// Decides chunk boundaries.
pub trait CheckpointAlgorithm: Send + Sync {
    fn begin_checkpoint(&mut self) {}

    /// Called after every buffered item.
    fn is_ready_to_checkpoint(&mut self) -> bool;

    fn end_checkpoint(&mut self) {}
}

// ---------------------------------------------------------------------------
// Task artifacts
// ---------------------------------------------------------------------------

/// Single-call step body.
///
/// Stop requests are cooperative: a long-running batchlet should poll
/// `InjectionContext::is_stop_requested` and return early.
#[async_trait]
pub trait Batchlet: Send + Sync {
    /// Returns the step exit status, if it wants to set one.
    async fn process(&mut self) -> Result<Option<String>, ArtifactError>;
}

// ---------------------------------------------------------------------------
// Partition artifacts
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PartitionMapper: Send + Sync {
    async fn map_partitions(&mut self) -> Result<PartitionPlan, ArtifactError>;
}

/// Outcome passed to [`PartitionReducer::after_partitioned_step_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Commit,
    Rollback,
}

#[async_trait]
pub trait PartitionReducer: Send + Sync {
    async fn begin_partitioned_step(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }

    async fn before_partitioned_step_completion(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }

    async fn rollback_partitioned_step(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }

    async fn after_partitioned_step_completion(
        &mut self,
        status: PartitionStatus,
    ) -> Result<(), ArtifactError>;
}

/// Runs inside each partition; its data is handed to the analyzer.
#[async_trait]
pub trait PartitionCollector: Send + Sync {
    async fn collect_partition_data(&mut self) -> Result<Option<Value>, ArtifactError>;
}

/// Runs on the coordinator only.
#[async_trait]
pub trait PartitionAnalyzer: Send + Sync {
    async fn analyze_collector_data(&mut self, _data: Value) -> Result<(), ArtifactError> {
        Ok(())
    }

    async fn analyze_status(
        &mut self,
        _batch_status: BatchStatus,
        _exit_status: Option<String>,
    ) -> Result<(), ArtifactError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decision and listeners
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Decider: Send + Sync {
    /// Exit status of the decision, given the previous element's step executions.
    async fn decide(&mut self, executions: &[StepExecution]) -> Result<String, ArtifactError>;
}

#[async_trait]
pub trait StepListener: Send + Sync {
    async fn before_step(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }

    async fn after_step(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

#[async_trait]
pub trait JobListener: Send + Sync {
    async fn before_job(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }

    async fn after_job(&mut self) -> Result<(), ArtifactError> {
        Ok(())
    }
}
