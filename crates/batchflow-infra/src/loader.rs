//! Job descriptors read from a directory of YAML files.
//!
//! `jobName` resolves to `{dir}/{jobName}.yaml`. The file holds a serialized
//! [`JobDefinition`] whose `id` must equal the requested name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use batchflow_core::engine::JobLoader;
use batchflow_core::error::BatchError;
use batchflow_types::model::JobDefinition;

/// Loads job definitions from `{dir}/{name}.yaml` on every start.
#[derive(Debug, Clone)]
pub struct YamlDirectoryLoader {
    dir: PathBuf,
}

impl YamlDirectoryLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_name: &str) -> Result<PathBuf, BatchError> {
        // Names are file stems, never paths.
        if job_name.is_empty() || job_name.contains(['/', '\\']) || job_name.starts_with('.') {
            return Err(BatchError::NoSuchJob(job_name.to_string()));
        }
        Ok(self.dir.join(format!("{job_name}.yaml")))
    }
}

/// Parse and validate one YAML job descriptor.
pub fn parse_job_definition(yaml: &str) -> Result<JobDefinition, BatchError> {
    let definition: JobDefinition = serde_yaml_ng::from_str(yaml)
        .map_err(|e| BatchError::InvalidDefinition(e.to_string()))?;
    definition
        .validate()
        .map_err(|e| BatchError::InvalidDefinition(e.to_string()))?;
    Ok(definition)
}

#[async_trait]
impl JobLoader for YamlDirectoryLoader {
    async fn load(&self, job_name: &str) -> Result<JobDefinition, BatchError> {
        let path = self.path_for(job_name)?;
        let yaml = match tokio::fs::read_to_string(&path).await {
            Ok(yaml) => yaml,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BatchError::NoSuchJob(job_name.to_string()));
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not read job descriptor");
                return Err(BatchError::InvalidDefinition(format!(
                    "{}: {err}",
                    path.display()
                )));
            }
        };

        let definition = parse_job_definition(&yaml)?;
        if definition.id != job_name {
            return Err(BatchError::InvalidDefinition(format!(
                "{} declares job '{}'",
                path.display(),
                definition.id
            )));
        }
        tracing::debug!(job = job_name, path = %path.display(), "job descriptor loaded");
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_types::model::{ExecutionElement, StepBody, Transition};
    use tempfile::TempDir;

    const PAYROLL: &str = r#"
id: payroll
properties:
  region: eu
elements:
  - type: step
    id: load
    next: report
    body:
      kind: chunk
      reader:
        ref: csv_reader
        properties:
          file: input.csv
      writer:
        ref: db_writer
      item_count: 2
      skip_limit: 3
      skippable:
        include: [bad_record]
  - type: step
    id: report
    body:
      kind: batchlet
      ref: report_batchlet
    transitions:
      - type: fail
        on: "FAILED"
        exit_status: REPORT_FAILED
      - type: end
        on: "*"
"#;

    #[tokio::test]
    async fn test_loads_descriptor_by_name() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("payroll.yaml"), PAYROLL)
            .await
            .unwrap();
        let loader = YamlDirectoryLoader::new(tmp.path());

        let job = loader.load("payroll").await.unwrap();
        assert!(job.restartable);
        assert_eq!(job.properties.get("region").map(String::as_str), Some("eu"));
        assert_eq!(job.elements.len(), 2);

        let ExecutionElement::Step(load) = &job.elements[0] else {
            panic!("expected a step");
        };
        let StepBody::Chunk(chunk) = &load.body else {
            panic!("expected a chunk step");
        };
        assert_eq!(chunk.reader.name, "csv_reader");
        assert_eq!(chunk.item_count, Some(2));
        assert!(chunk.skippable.matches("bad_record"));

        assert!(matches!(
            job.elements[1].transitions()[0],
            Transition::Fail { ref exit_status, .. } if exit_status.as_deref() == Some("REPORT_FAILED")
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_no_such_job() {
        let tmp = TempDir::new().unwrap();
        let loader = YamlDirectoryLoader::new(tmp.path());
        assert!(matches!(
            loader.load("payroll").await.unwrap_err(),
            BatchError::NoSuchJob(name) if name == "payroll"
        ));
        assert!(matches!(
            loader.load("../etc/passwd").await.unwrap_err(),
            BatchError::NoSuchJob(_)
        ));
    }

    #[tokio::test]
    async fn test_mismatched_or_broken_descriptors_are_invalid() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("other.yaml"), PAYROLL)
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("broken.yaml"), "id: broken\nelements: [")
            .await
            .unwrap();
        let loader = YamlDirectoryLoader::new(tmp.path());

        assert!(matches!(
            loader.load("other").await.unwrap_err(),
            BatchError::InvalidDefinition(_)
        ));
        assert!(matches!(
            loader.load("broken").await.unwrap_err(),
            BatchError::InvalidDefinition(_)
        ));
    }

    #[test]
    fn test_dangling_transition_target_is_rejected() {
        let yaml = r#"
id: bad
elements:
  - type: step
    id: only
    next: nowhere
    body:
      kind: batchlet
      ref: noop
"#;
        assert!(matches!(
            parse_job_definition(yaml).unwrap_err(),
            BatchError::InvalidDefinition(msg) if msg.contains("nowhere")
        ));
    }

    mod end_to_end {
        use std::sync::{Arc, Mutex};
        use std::time::Duration;

        use async_trait::async_trait;
        use batchflow_core::JobOperator;
        use batchflow_core::artifact::{ArtifactRegistry, Item, ItemReader, ItemWriter};
        use batchflow_core::engine::ServiceContext;
        use batchflow_types::config::EngineConfig;
        use batchflow_types::error::ArtifactError;
        use batchflow_types::execution::Properties;
        use batchflow_types::status::BatchStatus;
        use serde_json::{Value, json};
        use tempfile::TempDir;

        use crate::loader::YamlDirectoryLoader;
        use crate::sqlite::{DatabasePool, SqlitePersistence};

        const NUMBERS: &str = r#"
id: numbers
elements:
  - type: step
    id: count
    body:
      kind: chunk
      reader:
        ref: counter
        properties:
          count: "5"
      writer:
        ref: sink
      item_count: 2
"#;

        struct Counter {
            next: u64,
            last: u64,
        }

        #[async_trait]
        impl ItemReader for Counter {
            async fn open(&mut self, checkpoint: Option<Value>) -> Result<(), ArtifactError> {
                if let Some(position) = checkpoint.and_then(|v| v.as_u64()) {
                    self.next = position;
                }
                Ok(())
            }

            async fn read_item(&mut self) -> Result<Option<Item>, ArtifactError> {
                if self.next >= self.last {
                    return Ok(None);
                }
                self.next += 1;
                Ok(Some(json!(self.next)))
            }

            async fn checkpoint_info(&mut self) -> Result<Option<Value>, ArtifactError> {
                Ok(Some(json!(self.next)))
            }
        }

        struct Sink(Arc<Mutex<Vec<Item>>>);

        #[async_trait]
        impl ItemWriter for Sink {
            async fn write_items(&mut self, items: &[Item]) -> Result<(), ArtifactError> {
                self.0.lock().unwrap().extend_from_slice(items);
                Ok(())
            }
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn test_yaml_chunk_job_runs_on_sqlite() {
            let tmp = TempDir::new().unwrap();
            tokio::fs::write(tmp.path().join("numbers.yaml"), NUMBERS)
                .await
                .unwrap();
            let url = format!("sqlite://{}?mode=rwc", tmp.path().join("batch.db").display());
            let persistence = SqlitePersistence::new(DatabasePool::new(&url).await.unwrap());

            let written = Arc::new(Mutex::new(Vec::new()));
            let registry = ArtifactRegistry::new();
            registry.register_reader("counter", |ctx| {
                let last = ctx
                    .property("count")
                    .and_then(|c| c.parse().ok())
                    .ok_or_else(|| ArtifactError::new("config", "count is required"))?;
                Ok(Box::new(Counter { next: 0, last }) as Box<dyn ItemReader>)
            });
            let sink = written.clone();
            registry.register_writer("sink", move |_| {
                Ok(Box::new(Sink(sink.clone())) as Box<dyn ItemWriter>)
            });

            let services = ServiceContext::new(
                EngineConfig::default(),
                Arc::new(persistence),
                Arc::new(registry),
                Arc::new(YamlDirectoryLoader::new(tmp.path())),
            )
            .unwrap();
            let operator = JobOperator::new(services);

            let execution_id = operator.start("numbers", Properties::new()).await.unwrap();
            let execution = operator
                .wait_for_termination(execution_id, Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(execution.batch_status, BatchStatus::Completed);

            let steps = operator.get_step_executions(execution_id).await.unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].metrics.read_count, 5);
            assert_eq!(steps[0].metrics.write_count, 5);
            assert_eq!(written.lock().unwrap().len(), 5);
            assert_eq!(operator.get_job_names().await.unwrap(), vec!["numbers"]);
        }
    }
}
