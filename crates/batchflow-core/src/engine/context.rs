//! Runtime contexts shared between the controllers and user artifacts.
//!
//! `JobContext` and `StepContext` hold the mutable runtime state of one job
//! execution and one step execution. They are handed to artifacts through an
//! explicit [`InjectionContext`] at construction time.

use std::sync::Arc;

use batchflow_types::execution::{Properties, StepMetrics};
use batchflow_types::status::BatchStatus;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// JobContext
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct JobState {
    batch_status: BatchStatus,
    exit_status: Option<String>,
    transient_user_data: Option<Value>,
}

/// Runtime state of one job execution.
#[derive(Debug)]
pub struct JobContext {
    job_name: String,
    instance_id: i64,
    execution_id: i64,
    properties: Properties,
    parameters: Properties,
    stop: CancellationToken,
    state: Mutex<JobState>,
}

impl JobContext {
    pub fn new(
        job_name: impl Into<String>,
        instance_id: i64,
        execution_id: i64,
        properties: Properties,
        parameters: Properties,
        stop: CancellationToken,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            instance_id,
            execution_id,
            properties,
            parameters,
            stop,
            state: Mutex::new(JobState {
                batch_status: BatchStatus::Starting,
                exit_status: None,
                transient_user_data: None,
            }),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn parameters(&self) -> &Properties {
        &self.parameters
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.state.lock().batch_status
    }

    pub fn set_batch_status(&self, status: BatchStatus) {
        self.state.lock().batch_status = status;
    }

    pub fn exit_status(&self) -> Option<String> {
        self.state.lock().exit_status.clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.state.lock().exit_status = Some(exit_status.into());
    }

    pub fn transient_user_data(&self) -> Option<Value> {
        self.state.lock().transient_user_data.clone()
    }

    pub fn set_transient_user_data(&self, data: Value) {
        self.state.lock().transient_user_data = Some(data);
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StepState {
    batch_status: BatchStatus,
    exit_status: Option<String>,
    persistent_user_data: Option<Value>,
    transient_user_data: Option<Value>,
    metrics: StepMetrics,
    error: Option<String>,
}

/// Runtime state of one step execution.
///
/// Metrics live here while the step runs; the chunk loop copies them into
/// the persisted step execution at every commit.
#[derive(Debug)]
pub struct StepContext {
    step_name: String,
    step_execution_id: i64,
    properties: Properties,
    state: Mutex<StepState>,
}

impl StepContext {
    pub fn new(step_name: impl Into<String>, step_execution_id: i64, properties: Properties) -> Self {
        Self {
            step_name: step_name.into(),
            step_execution_id,
            properties,
            state: Mutex::new(StepState {
                batch_status: BatchStatus::Starting,
                exit_status: None,
                persistent_user_data: None,
                transient_user_data: None,
                metrics: StepMetrics::default(),
                error: None,
            }),
        }
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn step_execution_id(&self) -> i64 {
        self.step_execution_id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn batch_status(&self) -> BatchStatus {
        self.state.lock().batch_status
    }

    pub fn set_batch_status(&self, status: BatchStatus) {
        self.state.lock().batch_status = status;
    }

    pub fn exit_status(&self) -> Option<String> {
        self.state.lock().exit_status.clone()
    }

    pub fn set_exit_status(&self, exit_status: impl Into<String>) {
        self.state.lock().exit_status = Some(exit_status.into());
    }

    /// Set the exit status only if nothing set one already.
    pub fn default_exit_status(&self, exit_status: impl Into<String>) {
        let mut state = self.state.lock();
        if state.exit_status.is_none() {
            state.exit_status = Some(exit_status.into());
        }
    }

    pub fn persistent_user_data(&self) -> Option<Value> {
        self.state.lock().persistent_user_data.clone()
    }

    /// Saved with every checkpoint and at step end; restored on restart.
    pub fn set_persistent_user_data(&self, data: Value) {
        self.state.lock().persistent_user_data = Some(data);
    }

    pub(crate) fn restore_persistent_user_data(&self, data: Option<Value>) {
        self.state.lock().persistent_user_data = data;
    }

    pub fn transient_user_data(&self) -> Option<Value> {
        self.state.lock().transient_user_data.clone()
    }

    pub fn set_transient_user_data(&self, data: Value) {
        self.state.lock().transient_user_data = Some(data);
    }

    pub fn metrics(&self) -> StepMetrics {
        self.state.lock().metrics
    }

    pub(crate) fn set_metrics(&self, metrics: StepMetrics) {
        self.state.lock().metrics = metrics;
    }

    pub(crate) fn update_metrics(&self, f: impl FnOnce(&mut StepMetrics)) {
        f(&mut self.state.lock().metrics);
    }

    /// Message of the error that failed the step body, if any.
    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub(crate) fn set_error(&self, error: impl Into<String>) {
        self.state.lock().error = Some(error.into());
    }
}

// ---------------------------------------------------------------------------
// InjectionContext
// ---------------------------------------------------------------------------

/// Everything an artifact receives at construction time.
#[derive(Debug, Clone)]
pub struct InjectionContext {
    pub job: Arc<JobContext>,
    pub step: Option<Arc<StepContext>>,
    /// Properties declared on the artifact reference.
    pub properties: Properties,
}

impl InjectionContext {
    pub fn for_job(job: Arc<JobContext>) -> Self {
        Self {
            job,
            step: None,
            properties: Properties::new(),
        }
    }

    pub fn for_step(job: Arc<JobContext>, step: Arc<StepContext>) -> Self {
        Self {
            job,
            step: Some(step),
            properties: Properties::new(),
        }
    }

    pub fn with_properties(&self, properties: &Properties) -> Self {
        Self {
            properties: properties.clone(),
            ..self.clone()
        }
    }

    /// Artifact property, falling back to step then job properties.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .or_else(|| self.step.as_ref().and_then(|s| s.properties().get(key)))
            .or_else(|| self.job.properties().get(key))
            .map(String::as_str)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.job.is_stop_requested()
    }
}
