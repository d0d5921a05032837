//! SQLite implementation of the batch persistence port.
//!
//! Implements `PersistenceService` from `batchflow-core` using sqlx with split
//! read/write pools. Timestamps are stored as RFC 3339 text, statuses by
//! their canonical upper-case name, and properties, metrics, user data and
//! checkpoints as JSON text. A chunk commit runs in one writer transaction.

use async_trait::async_trait;
use batchflow_core::repository::PersistenceService;
use batchflow_types::error::RepositoryError;
use batchflow_types::execution::{
    CheckpointDataKey, ChunkCommit, JobExecution, JobInstance, JobStatus, Properties,
    StepExecution, StepMetrics, StepStatus, TimestampKind,
};
use batchflow_types::status::BatchStatus;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `PersistenceService`.
pub struct SqlitePersistence {
    pool: DatabasePool,
}

impl SqlitePersistence {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const INSTANCE_COLUMNS: &str = "instance_id, job_name, tag, descriptor, parent_instance_id";

const EXECUTION_COLUMNS: &str = "execution_id, instance_id, job_name, batch_status, exit_status, \
     create_time, start_time, end_time, last_updated_time, parameters";

const STEP_EXECUTION_COLUMNS: &str = "step_execution_id, job_execution_id, step_name, \
     batch_status, exit_status, start_time, end_time, metrics, persistent_user_data";

const STEP_STATUS_COLUMNS: &str = "instance_id, step_name, last_step_execution_id, batch_status, \
     exit_status, start_count, persistent_user_data, committed_metrics, partition_count";

fn instance_from_row(row: &SqliteRow) -> Result<JobInstance, RepositoryError> {
    Ok(JobInstance {
        instance_id: row.try_get("instance_id").map_err(query_error)?,
        job_name: row.try_get("job_name").map_err(query_error)?,
        tag: row.try_get("tag").map_err(query_error)?,
        descriptor: row.try_get("descriptor").map_err(query_error)?,
        parent_instance_id: row.try_get("parent_instance_id").map_err(query_error)?,
    })
}

struct JobExecutionRow {
    execution_id: i64,
    instance_id: i64,
    job_name: String,
    batch_status: String,
    exit_status: Option<String>,
    create_time: String,
    start_time: Option<String>,
    end_time: Option<String>,
    last_updated_time: String,
    parameters: String,
}

impl JobExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            instance_id: row.try_get("instance_id")?,
            job_name: row.try_get("job_name")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            last_updated_time: row.try_get("last_updated_time")?,
            parameters: row.try_get("parameters")?,
        })
    }

    fn into_execution(self) -> Result<JobExecution, RepositoryError> {
        let parameters: Properties = serde_json::from_str(&self.parameters)
            .map_err(|e| RepositoryError::Query(format!("invalid parameters JSON: {e}")))?;
        Ok(JobExecution {
            execution_id: self.execution_id,
            instance_id: self.instance_id,
            job_name: self.job_name,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            create_time: parse_datetime(&self.create_time)?,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            last_updated_time: parse_datetime(&self.last_updated_time)?,
            parameters,
        })
    }
}

struct StepExecutionRow {
    step_execution_id: i64,
    job_execution_id: i64,
    step_name: String,
    batch_status: String,
    exit_status: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    metrics: String,
    persistent_user_data: Option<String>,
}

impl StepExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_execution_id: row.try_get("step_execution_id")?,
            job_execution_id: row.try_get("job_execution_id")?,
            step_name: row.try_get("step_name")?,
            batch_status: row.try_get("batch_status")?,
            exit_status: row.try_get("exit_status")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            metrics: row.try_get("metrics")?,
            persistent_user_data: row.try_get("persistent_user_data")?,
        })
    }

    fn into_step_execution(self) -> Result<StepExecution, RepositoryError> {
        Ok(StepExecution {
            step_execution_id: self.step_execution_id,
            job_execution_id: self.job_execution_id,
            step_name: self.step_name,
            batch_status: parse_status(&self.batch_status)?,
            exit_status: self.exit_status,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            metrics: parse_metrics(&self.metrics)?,
            persistent_user_data: parse_optional_json(self.persistent_user_data.as_deref())?,
        })
    }
}

fn step_status_from_row(row: &SqliteRow) -> Result<StepStatus, RepositoryError> {
    let batch_status: String = row.try_get("batch_status").map_err(query_error)?;
    let start_count: i64 = row.try_get("start_count").map_err(query_error)?;
    let user_data: Option<String> = row.try_get("persistent_user_data").map_err(query_error)?;
    let metrics: String = row.try_get("committed_metrics").map_err(query_error)?;
    let partition_count: Option<i64> = row.try_get("partition_count").map_err(query_error)?;
    Ok(StepStatus {
        instance_id: row.try_get("instance_id").map_err(query_error)?,
        step_name: row.try_get("step_name").map_err(query_error)?,
        last_step_execution_id: row.try_get("last_step_execution_id").map_err(query_error)?,
        batch_status: parse_status(&batch_status)?,
        exit_status: row.try_get("exit_status").map_err(query_error)?,
        start_count: start_count as u32,
        persistent_user_data: parse_optional_json(user_data.as_deref())?,
        committed_metrics: parse_metrics(&metrics)?,
        partition_count: partition_count.map(|c| c as u32),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_status(s: &str) -> Result<BatchStatus, RepositoryError> {
    s.parse::<BatchStatus>()
        .map_err(|e| RepositoryError::Query(e.to_string()))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_metrics(s: &str) -> Result<StepMetrics, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid metrics JSON: {e}")))
}

fn parse_optional_json(s: Option<&str>) -> Result<Option<Value>, RepositoryError> {
    s.map(|s| {
        serde_json::from_str(s)
            .map_err(|e| RepositoryError::Query(format!("invalid user data JSON: {e}")))
    })
    .transpose()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    Ok(serde_json::to_string(value)?)
}

fn optional_json(value: Option<&Value>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

// ---------------------------------------------------------------------------
// Statement bodies shared by plain writes and the chunk-commit transaction
// ---------------------------------------------------------------------------

const UPDATE_STEP_EXECUTION: &str = r#"UPDATE step_executions SET
       batch_status = ?, exit_status = ?, start_time = ?, end_time = ?,
       metrics = ?, persistent_user_data = ?
     WHERE step_execution_id = ?"#;

const UPSERT_STEP_STATUS: &str = r#"INSERT INTO step_statuses
       (instance_id, step_name, last_step_execution_id, batch_status, exit_status,
        start_count, persistent_user_data, committed_metrics, partition_count)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(instance_id, step_name) DO UPDATE SET
       last_step_execution_id = excluded.last_step_execution_id,
       batch_status = excluded.batch_status,
       exit_status = excluded.exit_status,
       start_count = excluded.start_count,
       persistent_user_data = excluded.persistent_user_data,
       committed_metrics = excluded.committed_metrics,
       partition_count = excluded.partition_count"#;

const UPSERT_CHECKPOINT: &str = r#"INSERT INTO checkpoints (instance_id, step_name, stream, data)
     VALUES (?, ?, ?, ?)
     ON CONFLICT(instance_id, step_name, stream) DO UPDATE SET data = excluded.data"#;

struct StepExecutionParams {
    batch_status: &'static str,
    exit_status: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    metrics: String,
    user_data: Option<String>,
    id: i64,
}

impl StepExecutionParams {
    fn new(step: &StepExecution) -> Result<Self, RepositoryError> {
        Ok(Self {
            batch_status: step.batch_status.as_str(),
            exit_status: step.exit_status.clone(),
            start_time: step.start_time.as_ref().map(format_datetime),
            end_time: step.end_time.as_ref().map(format_datetime),
            metrics: to_json(&step.metrics)?,
            user_data: optional_json(step.persistent_user_data.as_ref())?,
            id: step.step_execution_id,
        })
    }
}

struct StepStatusParams {
    instance_id: i64,
    step_name: String,
    last_step_execution_id: i64,
    batch_status: &'static str,
    exit_status: Option<String>,
    start_count: i64,
    user_data: Option<String>,
    committed_metrics: String,
    partition_count: Option<i64>,
}

impl StepStatusParams {
    fn new(status: &StepStatus) -> Result<Self, RepositoryError> {
        Ok(Self {
            instance_id: status.instance_id,
            step_name: status.step_name.clone(),
            last_step_execution_id: status.last_step_execution_id,
            batch_status: status.batch_status.as_str(),
            exit_status: status.exit_status.clone(),
            start_count: i64::from(status.start_count),
            user_data: optional_json(status.persistent_user_data.as_ref())?,
            committed_metrics: to_json(&status.committed_metrics)?,
            partition_count: status.partition_count.map(i64::from),
        })
    }
}

// ---------------------------------------------------------------------------
// PersistenceService impl
// ---------------------------------------------------------------------------

#[async_trait]
impl PersistenceService for SqlitePersistence {
    async fn create_job_instance(
        &self,
        job_name: &str,
        tag: &str,
        descriptor: &str,
        parent_instance_id: Option<i64>,
    ) -> Result<JobInstance, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO job_instances (job_name, tag, descriptor, parent_instance_id) VALUES (?, ?, ?, ?)",
        )
        .bind(job_name)
        .bind(tag)
        .bind(descriptor)
        .bind(parent_instance_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(JobInstance {
            instance_id: result.last_insert_rowid(),
            job_name: job_name.to_string(),
            tag: tag.to_string(),
            descriptor: descriptor.to_string(),
            parent_instance_id,
        })
    }

    async fn get_job_instance(
        &self,
        instance_id: i64,
    ) -> Result<Option<JobInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE instance_id = ?"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn find_sub_job_instances(
        &self,
        parent_instance_id: i64,
        job_name: &str,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances WHERE parent_instance_id = ? AND job_name = ?"
        ))
        .bind(parent_instance_id)
        .bind(job_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn get_job_instances(
        &self,
        job_name: &str,
        tag: Option<&str>,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobInstance>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM job_instances
             WHERE parent_instance_id IS NULL AND job_name = ? AND (? IS NULL OR tag = ?)
             ORDER BY instance_id DESC LIMIT ? OFFSET ?"
        ))
        .bind(job_name)
        .bind(tag)
        .bind(tag)
        .bind(count as i64)
        .bind(start as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn count_job_instances(
        &self,
        job_name: &str,
        tag: Option<&str>,
    ) -> Result<u64, RepositoryError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM job_instances
             WHERE parent_instance_id IS NULL AND job_name = ? AND (? IS NULL OR tag = ?)",
        )
        .bind(job_name)
        .bind(tag)
        .bind(tag)
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_error)?;
        Ok(count as u64)
    }

    async fn get_job_names(&self, tag: Option<&str>) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT job_name FROM job_instances
             WHERE parent_instance_id IS NULL AND (? IS NULL OR tag = ?)
             ORDER BY job_name",
        )
        .bind(tag)
        .bind(tag)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    // -----------------------------------------------------------------------
    // Job executions
    // -----------------------------------------------------------------------

    async fn create_job_execution(
        &self,
        instance_id: i64,
        parameters: &Properties,
    ) -> Result<JobExecution, RepositoryError> {
        let job_name: Option<(String,)> =
            sqlx::query_as("SELECT job_name FROM job_instances WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(query_error)?;
        let (job_name,) = job_name.ok_or(RepositoryError::NotFound)?;

        let now = Utc::now();
        let result = sqlx::query(
            r#"INSERT INTO job_executions
                 (instance_id, job_name, batch_status, create_time, last_updated_time, parameters)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(instance_id)
        .bind(&job_name)
        .bind(BatchStatus::Starting.as_str())
        .bind(format_datetime(&now))
        .bind(format_datetime(&now))
        .bind(to_json(parameters)?)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(JobExecution {
            execution_id: result.last_insert_rowid(),
            instance_id,
            job_name,
            batch_status: BatchStatus::Starting,
            exit_status: None,
            create_time: now,
            start_time: None,
            end_time: None,
            last_updated_time: now,
            parameters: parameters.clone(),
        })
    }

    async fn get_job_execution(
        &self,
        execution_id: i64,
    ) -> Result<Option<JobExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE execution_id = ?"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = JobExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn get_job_executions(
        &self,
        instance_id: i64,
    ) -> Result<Vec<JobExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE instance_id = ? ORDER BY execution_id"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                JobExecutionRow::from_row(row)
                    .map_err(query_error)
                    .and_then(JobExecutionRow::into_execution)
            })
            .collect()
    }

    async fn most_recent_execution_id(
        &self,
        instance_id: i64,
    ) -> Result<Option<i64>, RepositoryError> {
        let (latest,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(execution_id) FROM job_executions WHERE instance_id = ?")
                .bind(instance_id)
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_error)?;
        Ok(latest)
    }

    async fn get_running_execution_ids(
        &self,
        job_name: &str,
    ) -> Result<Vec<i64>, RepositoryError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"SELECT e.execution_id FROM job_executions e
               JOIN job_instances i ON i.instance_id = e.instance_id
               WHERE e.job_name = ? AND i.parent_instance_id IS NULL
                 AND e.batch_status IN ('STARTING', 'STARTED', 'STOPPING')
               ORDER BY e.execution_id"#,
        )
        .bind(job_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn update_batch_status(
        &self,
        execution_id: i64,
        status: BatchStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE job_executions SET batch_status = ?, last_updated_time = ? WHERE execution_id = ?",
        )
        .bind(status.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(execution_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn mark_execution_stopping(&self, execution_id: i64) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let updated = sqlx::query(
            r#"UPDATE job_executions SET batch_status = 'STOPPING', last_updated_time = ?
               WHERE execution_id = ? AND batch_status IN ('STARTING', 'STARTED')"#,
        )
        .bind(format_datetime(&Utc::now()))
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM job_executions WHERE execution_id = ?")
                .bind(execution_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?;
            return match exists {
                Some(_) => Ok(false),
                None => Err(RepositoryError::NotFound),
            };
        }

        sqlx::query(
            r#"UPDATE job_statuses SET batch_status = 'STOPPING'
               WHERE latest_execution_id = ?
                 AND instance_id = (SELECT instance_id FROM job_executions WHERE execution_id = ?)"#,
        )
        .bind(execution_id)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(true)
    }

    async fn mark_execution_started(&self, execution_id: i64) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            "UPDATE job_executions SET batch_status = ?, start_time = ?, last_updated_time = ? WHERE execution_id = ?",
        )
        .bind(BatchStatus::Started.as_str())
        .bind(&now)
        .bind(&now)
        .bind(execution_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_execution_final(
        &self,
        execution_id: i64,
        status: BatchStatus,
        exit_status: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let result = sqlx::query(
            r#"UPDATE job_executions SET
                 batch_status = ?, exit_status = ?, end_time = ?, last_updated_time = ?
               WHERE execution_id = ?"#,
        )
        .bind(status.as_str())
        .bind(exit_status)
        .bind(&now)
        .bind(&now)
        .bind(execution_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Point queries
    // -----------------------------------------------------------------------

    async fn get_batch_status(&self, execution_id: i64) -> Result<BatchStatus, RepositoryError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT batch_status FROM job_executions WHERE execution_id = ?")
                .bind(execution_id)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_error)?;
        let (status,) = row.ok_or(RepositoryError::NotFound)?;
        parse_status(&status)
    }

    async fn get_exit_status(&self, execution_id: i64) -> Result<Option<String>, RepositoryError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT exit_status FROM job_executions WHERE execution_id = ?")
                .bind(execution_id)
                .fetch_optional(&self.pool.reader)
                .await
                .map_err(query_error)?;
        let (exit_status,) = row.ok_or(RepositoryError::NotFound)?;
        Ok(exit_status)
    }

    async fn get_timestamp(
        &self,
        execution_id: i64,
        kind: TimestampKind,
    ) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let column = match kind {
            TimestampKind::Create => "create_time",
            TimestampKind::Start => "start_time",
            TimestampKind::End => "end_time",
            TimestampKind::LastUpdated => "last_updated_time",
        };
        let row: Option<(Option<String>,)> = sqlx::query_as(&format!(
            "SELECT {column} FROM job_executions WHERE execution_id = ?"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;
        let (value,) = row.ok_or(RepositoryError::NotFound)?;
        value.as_deref().map(parse_datetime).transpose()
    }

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    async fn create_step_execution(
        &self,
        job_execution_id: i64,
        step_name: &str,
    ) -> Result<StepExecution, RepositoryError> {
        let metrics = StepMetrics::default();
        let result = sqlx::query(
            "INSERT INTO step_executions (job_execution_id, step_name, batch_status, metrics) VALUES (?, ?, ?, ?)",
        )
        .bind(job_execution_id)
        .bind(step_name)
        .bind(BatchStatus::Starting.as_str())
        .bind(to_json(&metrics)?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                RepositoryError::NotFound
            }
            other => query_error(other),
        })?;

        Ok(StepExecution {
            step_execution_id: result.last_insert_rowid(),
            job_execution_id,
            step_name: step_name.to_string(),
            batch_status: BatchStatus::Starting,
            exit_status: None,
            start_time: None,
            end_time: None,
            metrics,
            persistent_user_data: None,
        })
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), RepositoryError> {
        let p = StepExecutionParams::new(step)?;
        let result = sqlx::query(UPDATE_STEP_EXECUTION)
            .bind(p.batch_status)
            .bind(p.exit_status)
            .bind(p.start_time)
            .bind(p.end_time)
            .bind(p.metrics)
            .bind(p.user_data)
            .bind(p.id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_step_execution(
        &self,
        step_execution_id: i64,
    ) -> Result<Option<StepExecution>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions WHERE step_execution_id = ?"
        ))
        .bind(step_execution_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = StepExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_step_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn get_step_executions(
        &self,
        job_execution_id: i64,
    ) -> Result<Vec<StepExecution>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions WHERE job_execution_id = ? ORDER BY step_execution_id"
        ))
        .bind(job_execution_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| {
                StepExecutionRow::from_row(row)
                    .map_err(query_error)
                    .and_then(StepExecutionRow::into_step_execution)
            })
            .collect()
    }

    async fn commit_chunk(&self, commit: &ChunkCommit) -> Result<(), RepositoryError> {
        let step = StepExecutionParams::new(&commit.step_execution)?;
        let status = StepStatusParams::new(&commit.step_status)?;
        let checkpoints = [&commit.reader_checkpoint, &commit.writer_checkpoint]
            .into_iter()
            .flatten()
            .map(|(key, value)| to_json(value).map(|data| (key, data)))
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let result = sqlx::query(UPDATE_STEP_EXECUTION)
            .bind(step.batch_status)
            .bind(step.exit_status)
            .bind(step.start_time)
            .bind(step.end_time)
            .bind(step.metrics)
            .bind(step.user_data)
            .bind(step.id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(UPSERT_STEP_STATUS)
            .bind(status.instance_id)
            .bind(status.step_name)
            .bind(status.last_step_execution_id)
            .bind(status.batch_status)
            .bind(status.exit_status)
            .bind(status.start_count)
            .bind(status.user_data)
            .bind(status.committed_metrics)
            .bind(status.partition_count)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        for (key, data) in checkpoints {
            sqlx::query(UPSERT_CHECKPOINT)
                .bind(key.instance_id)
                .bind(&key.step_name)
                .bind(key.stream.as_str())
                .bind(data)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        tracing::trace!(
            step_execution_id = commit.step_execution.step_execution_id,
            "chunk committed to sqlite"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status records
    // -----------------------------------------------------------------------

    async fn save_job_status(&self, status: &JobStatus) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO job_statuses
                 (instance_id, batch_status, exit_status, latest_execution_id, current_step, restart_on)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 batch_status = excluded.batch_status,
                 exit_status = excluded.exit_status,
                 latest_execution_id = excluded.latest_execution_id,
                 current_step = excluded.current_step,
                 restart_on = excluded.restart_on"#,
        )
        .bind(status.instance_id)
        .bind(status.batch_status.map(|s| s.as_str()))
        .bind(&status.exit_status)
        .bind(status.latest_execution_id)
        .bind(&status.current_step)
        .bind(&status.restart_on)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_job_status(&self, instance_id: i64) -> Result<Option<JobStatus>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT s.batch_status AS status, s.exit_status, s.latest_execution_id,
                      s.current_step, s.restart_on,
                      i.instance_id, i.job_name, i.tag, i.descriptor, i.parent_instance_id
               FROM job_statuses s
               JOIN job_instances i ON i.instance_id = s.instance_id
               WHERE s.instance_id = ?"#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let batch_status: Option<String> = row.try_get("status").map_err(query_error)?;
        Ok(Some(JobStatus {
            instance_id,
            job_instance: instance_from_row(&row)?,
            batch_status: batch_status.as_deref().map(parse_status).transpose()?,
            exit_status: row.try_get("exit_status").map_err(query_error)?,
            latest_execution_id: row.try_get("latest_execution_id").map_err(query_error)?,
            current_step: row.try_get("current_step").map_err(query_error)?,
            restart_on: row.try_get("restart_on").map_err(query_error)?,
        }))
    }

    async fn save_step_status(&self, status: &StepStatus) -> Result<(), RepositoryError> {
        let p = StepStatusParams::new(status)?;
        sqlx::query(UPSERT_STEP_STATUS)
            .bind(p.instance_id)
            .bind(p.step_name)
            .bind(p.last_step_execution_id)
            .bind(p.batch_status)
            .bind(p.exit_status)
            .bind(p.start_count)
            .bind(p.user_data)
            .bind(p.committed_metrics)
            .bind(p.partition_count)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn get_step_status(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<Option<StepStatus>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_STATUS_COLUMNS} FROM step_statuses WHERE instance_id = ? AND step_name = ?"
        ))
        .bind(instance_id)
        .bind(step_name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.as_ref().map(step_status_from_row).transpose()
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    async fn get_checkpoint(
        &self,
        key: &CheckpointDataKey,
    ) -> Result<Option<Value>, RepositoryError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT data FROM checkpoints WHERE instance_id = ? AND step_name = ? AND stream = ?",
        )
        .bind(key.instance_id)
        .bind(&key.step_name)
        .bind(key.stream.as_str())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        row.map(|(data,)| {
            serde_json::from_str(&data)
                .map_err(|e| RepositoryError::Query(format!("invalid checkpoint {key}: {e}")))
        })
        .transpose()
    }

    async fn set_checkpoint(
        &self,
        key: &CheckpointDataKey,
        value: &Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query(UPSERT_CHECKPOINT)
            .bind(key.instance_id)
            .bind(&key.step_name)
            .bind(key.stream.as_str())
            .bind(to_json(value)?)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn delete_checkpoints(
        &self,
        instance_id: i64,
        step_name: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM checkpoints WHERE instance_id = ? AND step_name = ?")
            .bind(instance_id)
            .bind(step_name)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Purge
    // -----------------------------------------------------------------------

    async fn purge(&self, tag: &str) -> Result<u64, RepositoryError> {
        // Sub-job instances, executions, statuses and checkpoints cascade.
        let result = sqlx::query(
            "DELETE FROM job_instances WHERE parent_instance_id IS NULL AND tag = ?",
        )
        .bind(tag)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        tracing::debug!(tag, removed = result.rows_affected(), "purged instances");
        Ok(result.rows_affected())
    }
}
