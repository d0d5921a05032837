//! Job definition lookup by name.

use async_trait::async_trait;
use batchflow_types::model::JobDefinition;
use dashmap::DashMap;

use crate::error::BatchError;

/// Resolves a job name to its definition at start time.
#[async_trait]
pub trait JobLoader: Send + Sync {
    async fn load(&self, job_name: &str) -> Result<JobDefinition, BatchError>;
}

/// Definitions registered programmatically.
#[derive(Debug, Default)]
pub struct InMemoryJobLoader {
    jobs: DashMap<String, JobDefinition>,
}

impl InMemoryJobLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a definition under its id.
    pub fn register(&self, job: JobDefinition) -> Result<(), BatchError> {
        job.validate()
            .map_err(|e| BatchError::InvalidDefinition(e.to_string()))?;
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }
}

#[async_trait]
impl JobLoader for InMemoryJobLoader {
    async fn load(&self, job_name: &str) -> Result<JobDefinition, BatchError> {
        self.jobs
            .get(job_name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BatchError::NoSuchJob(job_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_types::execution::Properties;

    #[tokio::test]
    async fn test_unknown_job_is_reported() {
        let loader = InMemoryJobLoader::new();
        let err = loader.load("missing").await.unwrap_err();
        assert!(matches!(err, BatchError::NoSuchJob(ref name) if name == "missing"));
    }

    #[test]
    fn test_invalid_definition_is_rejected_on_register() {
        let loader = InMemoryJobLoader::new();
        let err = loader
            .register(JobDefinition {
                id: "empty".to_string(),
                restartable: true,
                properties: Properties::new(),
                listeners: Vec::new(),
                elements: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidDefinition(_)));
    }
}
