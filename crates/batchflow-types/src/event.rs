//! Engine lifecycle events.
//!
//! `BatchEvent` is broadcast on the engine event bus. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::execution::StepMetrics;
use crate::status::BatchStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    JobStarted {
        execution_id: i64,
        instance_id: i64,
        job_name: String,
    },

    JobEnded {
        execution_id: i64,
        instance_id: i64,
        batch_status: BatchStatus,
        exit_status: Option<String>,
    },

    StepStarted {
        execution_id: i64,
        step_execution_id: i64,
        step_name: String,
    },

    StepEnded {
        execution_id: i64,
        step_execution_id: i64,
        step_name: String,
        batch_status: BatchStatus,
        exit_status: Option<String>,
    },

    /// A chunk boundary was committed.
    ChunkCommitted {
        step_execution_id: i64,
        step_name: String,
        metrics: StepMetrics,
    },

    /// One partition reported its final status to the coordinator.
    PartitionReported {
        step_name: String,
        partition: u32,
        batch_status: BatchStatus,
    },
}

impl BatchEvent {
    /// Short name of the event kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchEvent::JobStarted { .. } => "job_started",
            BatchEvent::JobEnded { .. } => "job_ended",
            BatchEvent::StepStarted { .. } => "step_started",
            BatchEvent::StepEnded { .. } => "step_ended",
            BatchEvent::ChunkCommitted { .. } => "chunk_committed",
            BatchEvent::PartitionReported { .. } => "partition_reported",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = BatchEvent::JobEnded {
            execution_id: 1,
            instance_id: 2,
            batch_status: BatchStatus::Completed,
            exit_status: Some("DONE".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_ended");
        assert_eq!(json["batch_status"], "COMPLETED");
        assert_eq!(event.kind(), "job_ended");
    }
}
