use std::sync::Arc;

use batchflow_types::execution::{JobExecution, TimestampKind};
use batchflow_types::status::BatchStatus;
use chrono::{DateTime, Utc};

use crate::error::BatchError;
use crate::repository::PersistenceService;

/// Lightweight view of one job execution.
///
/// Every accessor is a point query against persistence; nothing about the
/// running job is held in memory.
#[derive(Clone)]
pub struct JobExecutionHandle {
    execution_id: i64,
    persistence: Arc<dyn PersistenceService>,
}

impl JobExecutionHandle {
    pub fn new(execution_id: i64, persistence: Arc<dyn PersistenceService>) -> Self {
        Self {
            execution_id,
            persistence,
        }
    }

    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    pub async fn batch_status(&self) -> Result<BatchStatus, BatchError> {
        Ok(self.persistence.get_batch_status(self.execution_id).await?)
    }

    pub async fn exit_status(&self) -> Result<Option<String>, BatchError> {
        Ok(self.persistence.get_exit_status(self.execution_id).await?)
    }

    pub async fn create_time(&self) -> Result<Option<DateTime<Utc>>, BatchError> {
        self.timestamp(TimestampKind::Create).await
    }

    pub async fn start_time(&self) -> Result<Option<DateTime<Utc>>, BatchError> {
        self.timestamp(TimestampKind::Start).await
    }

    pub async fn end_time(&self) -> Result<Option<DateTime<Utc>>, BatchError> {
        self.timestamp(TimestampKind::End).await
    }

    pub async fn last_updated_time(&self) -> Result<Option<DateTime<Utc>>, BatchError> {
        self.timestamp(TimestampKind::LastUpdated).await
    }

    async fn timestamp(&self, kind: TimestampKind) -> Result<Option<DateTime<Utc>>, BatchError> {
        Ok(self.persistence.get_timestamp(self.execution_id, kind).await?)
    }

    /// Load the full execution record.
    pub async fn load(&self) -> Result<JobExecution, BatchError> {
        self.persistence
            .get_job_execution(self.execution_id)
            .await?
            .ok_or(BatchError::NoSuchJobExecution(self.execution_id))
    }
}

impl std::fmt::Debug for JobExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutionHandle")
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryPersistence;
    use batchflow_types::execution::Properties;

    #[tokio::test]
    async fn test_point_queries_follow_persisted_state() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let instance = persistence
            .create_job_instance("job", "default", "{}", None)
            .await
            .unwrap();
        let execution = persistence
            .create_job_execution(instance.instance_id, &Properties::new())
            .await
            .unwrap();
        let handle = JobExecutionHandle::new(execution.execution_id, persistence.clone());

        assert_eq!(handle.batch_status().await.unwrap(), BatchStatus::Starting);
        assert!(handle.start_time().await.unwrap().is_none());

        persistence
            .mark_execution_started(execution.execution_id)
            .await
            .unwrap();
        persistence
            .update_execution_final(execution.execution_id, BatchStatus::Completed, Some("DONE"))
            .await
            .unwrap();

        assert_eq!(handle.batch_status().await.unwrap(), BatchStatus::Completed);
        assert_eq!(handle.exit_status().await.unwrap().as_deref(), Some("DONE"));
        assert!(handle.start_time().await.unwrap().is_some());
        assert!(handle.end_time().await.unwrap().is_some());
        assert!(handle.create_time().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_execution_is_an_error() {
        let handle = JobExecutionHandle::new(404, Arc::new(InMemoryPersistence::new()));
        assert!(handle.batch_status().await.is_err());
        assert!(matches!(
            handle.load().await.unwrap_err(),
            BatchError::NoSuchJobExecution(404)
        ));
    }
}
