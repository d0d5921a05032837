//! Reusable artifacts and an operator harness for engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use batchflow_types::config::EngineConfig;
use batchflow_types::error::ArtifactError;
use batchflow_types::execution::{JobExecution, Properties, StepExecution};
use batchflow_types::model::{
    ArtifactRef, ChunkDefinition, CheckpointPolicy, ErrorClassifier, ExecutionElement,
    JobDefinition, StepBody, StepDefinition,
};
use batchflow_types::status::BatchStatus;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::artifact::{
    ArtifactRegistry, Batchlet, Decider, ItemProcessor, ItemReader, ItemWriter, PartitionAnalyzer,
    PartitionCollector, PartitionReducer, PartitionStatus, StepListener,
};
use crate::engine::{InMemoryJobLoader, JobOperator, ServiceContext};
use crate::error::BatchError;
use crate::repository::InMemoryPersistence;

// ---------------------------------------------------------------------------
// Readers / processors / writers
// ---------------------------------------------------------------------------

/// Reads `1..=count` as JSON numbers; the checkpoint is the next index.
///
/// While `crash` is set, reading the item at index `crash_at` fails with an
/// error of kind `"crash"`.
pub(crate) struct NumberReader {
    count: usize,
    position: usize,
    crash_at: Option<usize>,
    crash: Arc<AtomicBool>,
    failing: Vec<usize>,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl ItemReader for NumberReader {
    async fn open(&mut self, checkpoint: Option<Value>) -> Result<(), ArtifactError> {
        self.position = checkpoint
            .and_then(|c| c.as_u64())
            .map(|p| p as usize)
            .unwrap_or(0);
        Ok(())
    }

    async fn read_item(&mut self) -> Result<Option<Value>, ArtifactError> {
        if self.position >= self.count {
            return Ok(None);
        }
        if self.crash_at == Some(self.position) && self.crash.load(Ordering::SeqCst) {
            return Err(ArtifactError::new("crash", "simulated crash"));
        }
        let index = self.position;
        self.position += 1;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&index) {
            return Err(ArtifactError::new("bad_record", format!("record {index}")));
        }
        Ok(Some(json!(index + 1)))
    }

    async fn checkpoint_info(&mut self) -> Result<Option<Value>, ArtifactError> {
        Ok(Some(json!(self.position)))
    }
}

/// Drops even numbers; fails with kind `"bad_item"` on numbers listed in `failing`.
pub(crate) struct OddFilter {
    failing: Vec<u64>,
}

#[async_trait]
impl ItemProcessor for OddFilter {
    async fn process_item(&mut self, item: Value) -> Result<Option<Value>, ArtifactError> {
        let n = item.as_u64().unwrap_or_default();
        if self.failing.contains(&n) {
            return Err(ArtifactError::new("bad_item", format!("item {n}")));
        }
        Ok((n % 2 == 1).then_some(item))
    }
}

/// Appends every written item to a shared list and records chunk sizes.
pub(crate) struct CollectingWriter {
    written: Arc<Mutex<Vec<Value>>>,
    chunks: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl ItemWriter for CollectingWriter {
    async fn write_items(&mut self, items: &[Value]) -> Result<(), ArtifactError> {
        self.written.lock().extend_from_slice(items);
        self.chunks.lock().push(items.len());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batchlets / deciders / listeners
// ---------------------------------------------------------------------------

/// Returns the `exit` property, fails when `fail` is `"true"` and panics
/// when `panic` is `"true"`.
pub(crate) struct ScriptedBatchlet {
    exit: Option<String>,
    fail: bool,
    panic: bool,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Batchlet for ScriptedBatchlet {
    async fn process(&mut self) -> Result<Option<String>, ArtifactError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ArtifactError::new("scripted", "batchlet asked to fail"));
        }
        if self.panic {
            panic!("batchlet asked to panic");
        }
        Ok(self.exit.clone())
    }
}

/// Waits until the job is asked to stop, then returns early.
pub(crate) struct WaitForStopBatchlet {
    ctx: crate::engine::InjectionContext,
    started: Arc<AtomicBool>,
}

#[async_trait]
impl Batchlet for WaitForStopBatchlet {
    async fn process(&mut self) -> Result<Option<String>, ArtifactError> {
        self.started.store(true, Ordering::SeqCst);
        while !self.ctx.is_stop_requested() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(Some("INTERRUPTED".to_string()))
    }
}

/// Decides the `decision` property, falling back to the first input's exit status.
pub(crate) struct PropertyDecider {
    decision: Option<String>,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Decider for PropertyDecider {
    async fn decide(&mut self, executions: &[StepExecution]) -> Result<String, ArtifactError> {
        self.seen
            .lock()
            .extend(executions.iter().map(|e| e.step_name.clone()));
        Ok(self
            .decision
            .clone()
            .or_else(|| executions.first().and_then(|e| e.exit_status.clone()))
            .unwrap_or_default())
    }
}

pub(crate) struct RecordingStepListener {
    name: String,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StepListener for RecordingStepListener {
    async fn before_step(&mut self) -> Result<(), ArtifactError> {
        self.events.lock().push(format!("before:{}", self.name));
        Ok(())
    }

    async fn after_step(&mut self) -> Result<(), ArtifactError> {
        self.events.lock().push(format!("after:{}", self.name));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Partition artifacts
// ---------------------------------------------------------------------------

/// Emits the `partition` property once.
pub(crate) struct PropertyCollector {
    value: Option<String>,
}

#[async_trait]
impl PartitionCollector for PropertyCollector {
    async fn collect_partition_data(&mut self) -> Result<Option<Value>, ArtifactError> {
        Ok(self.value.take().map(Value::String))
    }
}

pub(crate) struct RecordingAnalyzer {
    data: Arc<Mutex<Vec<Value>>>,
    statuses: Arc<Mutex<Vec<BatchStatus>>>,
}

#[async_trait]
impl PartitionAnalyzer for RecordingAnalyzer {
    async fn analyze_collector_data(&mut self, data: Value) -> Result<(), ArtifactError> {
        self.data.lock().push(data);
        Ok(())
    }

    async fn analyze_status(
        &mut self,
        batch_status: BatchStatus,
        _exit_status: Option<String>,
    ) -> Result<(), ArtifactError> {
        self.statuses.lock().push(batch_status);
        Ok(())
    }
}

pub(crate) struct RecordingReducer {
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PartitionReducer for RecordingReducer {
    async fn begin_partitioned_step(&mut self) -> Result<(), ArtifactError> {
        self.events.lock().push("begin".to_string());
        Ok(())
    }

    async fn before_partitioned_step_completion(&mut self) -> Result<(), ArtifactError> {
        self.events.lock().push("before_completion".to_string());
        Ok(())
    }

    async fn rollback_partitioned_step(&mut self) -> Result<(), ArtifactError> {
        self.events.lock().push("rollback".to_string());
        Ok(())
    }

    async fn after_partitioned_step_completion(
        &mut self,
        status: PartitionStatus,
    ) -> Result<(), ArtifactError> {
        self.events.lock().push(format!("after:{status:?}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Shared state the registered artifacts write into.
#[derive(Default)]
pub(crate) struct Probes {
    pub crash: Arc<AtomicBool>,
    pub reads: Arc<AtomicUsize>,
    pub written: Arc<Mutex<Vec<Value>>>,
    pub chunks: Arc<Mutex<Vec<usize>>>,
    pub batchlet_runs: Arc<AtomicUsize>,
    pub stop_batchlet_started: Arc<AtomicBool>,
    pub decided_over: Arc<Mutex<Vec<String>>>,
    pub listener_events: Arc<Mutex<Vec<String>>>,
    pub collected: Arc<Mutex<Vec<Value>>>,
    pub partition_statuses: Arc<Mutex<Vec<BatchStatus>>>,
    pub reducer_events: Arc<Mutex<Vec<String>>>,
}

/// Operator over in-memory persistence with every test artifact registered.
///
/// Artifact names: reader `numbers` (properties `count`, `crash_at`,
/// `failing`), processor `odd`, writer `collect`, batchlet `script`
/// (`exit`, `fail`), batchlet `wait_for_stop`, decider `decide`
/// (`decision`), step listener `record`, collector `collector`, analyzer
/// `analyzer`, reducer `reducer`.
pub(crate) struct Harness {
    pub operator: JobOperator,
    pub persistence: Arc<InMemoryPersistence>,
    pub loader: Arc<InMemoryJobLoader>,
    pub artifacts: Arc<ArtifactRegistry>,
    pub probes: Probes,
}

fn list_property(value: Option<&str>) -> Vec<usize> {
    value
        .map(|v| v.split(',').filter_map(|n| n.trim().parse().ok()).collect())
        .unwrap_or_default()
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let persistence = Arc::new(InMemoryPersistence::new());
        let loader = Arc::new(InMemoryJobLoader::new());
        let artifacts = Arc::new(ArtifactRegistry::new());
        let probes = Probes::default();
        register_artifacts(&artifacts, &probes);

        let services = ServiceContext::new(
            config,
            persistence.clone(),
            artifacts.clone(),
            loader.clone(),
        )
        .unwrap();
        Self {
            operator: JobOperator::new(services),
            persistence,
            loader,
            artifacts,
            probes,
        }
    }

    pub fn register(&self, job: JobDefinition) {
        self.loader.register(job).unwrap();
    }

    pub async fn wait(&self, execution_id: i64) -> Result<JobExecution, BatchError> {
        self.operator
            .wait_for_termination(execution_id, Duration::from_secs(10))
            .await
    }

    /// Start `job_name` and wait for it to end.
    pub async fn run(&self, job_name: &str) -> Result<JobExecution, BatchError> {
        let id = self.operator.start(job_name, Properties::new()).await?;
        self.wait(id).await
    }

    /// Restart `execution_id` and wait for the new execution to end.
    pub async fn restart(&self, execution_id: i64) -> Result<JobExecution, BatchError> {
        let id = self.operator.restart(execution_id, Properties::new()).await?;
        self.wait(id).await
    }
}

fn register_artifacts(artifacts: &ArtifactRegistry, probes: &Probes) {
    let (crash, reads) = (probes.crash.clone(), probes.reads.clone());
    artifacts.register_reader("numbers", move |ctx| {
        Ok(Box::new(NumberReader {
            count: ctx.property("count").and_then(|c| c.parse().ok()).unwrap_or(5),
            position: 0,
            crash_at: ctx.property("crash_at").and_then(|c| c.parse().ok()),
            crash: crash.clone(),
            failing: list_property(ctx.property("failing")),
            reads: reads.clone(),
        }))
    });
    artifacts.register_processor("odd", |ctx| {
        Ok(Box::new(OddFilter {
            failing: list_property(ctx.property("failing"))
                .into_iter()
                .map(|n| n as u64)
                .collect(),
        }))
    });
    let (written, chunks) = (probes.written.clone(), probes.chunks.clone());
    artifacts.register_writer("collect", move |_| {
        Ok(Box::new(CollectingWriter {
            written: written.clone(),
            chunks: chunks.clone(),
        }))
    });
    let runs = probes.batchlet_runs.clone();
    artifacts.register_batchlet("script", move |ctx| {
        Ok(Box::new(ScriptedBatchlet {
            exit: ctx.property("exit").map(str::to_string),
            fail: ctx.property("fail") == Some("true"),
            panic: ctx.property("panic") == Some("true"),
            runs: runs.clone(),
        }))
    });
    let started = probes.stop_batchlet_started.clone();
    artifacts.register_batchlet("wait_for_stop", move |ctx| {
        Ok(Box::new(WaitForStopBatchlet {
            ctx: ctx.clone(),
            started: started.clone(),
        }))
    });
    let seen = probes.decided_over.clone();
    artifacts.register_decider("decide", move |ctx| {
        Ok(Box::new(PropertyDecider {
            decision: ctx.property("decision").map(str::to_string),
            seen: seen.clone(),
        }))
    });
    let events = probes.listener_events.clone();
    artifacts.register_step_listener("record", move |ctx| {
        Ok(Box::new(RecordingStepListener {
            name: ctx
                .step
                .as_ref()
                .map(|s| s.step_name().to_string())
                .unwrap_or_default(),
            events: events.clone(),
        }))
    });
    artifacts.register_partition_collector("collector", |ctx| {
        Ok(Box::new(PropertyCollector {
            value: ctx.property("partition").map(str::to_string),
        }))
    });
    let (data, statuses) = (probes.collected.clone(), probes.partition_statuses.clone());
    artifacts.register_partition_analyzer("analyzer", move |_| {
        Ok(Box::new(RecordingAnalyzer {
            data: data.clone(),
            statuses: statuses.clone(),
        }))
    });
    let reducer_events = probes.reducer_events.clone();
    artifacts.register_partition_reducer("reducer", move |_| {
        Ok(Box::new(RecordingReducer {
            events: reducer_events.clone(),
        }))
    });
}

// ---------------------------------------------------------------------------
// Definition builders
// ---------------------------------------------------------------------------

pub(crate) fn job(id: &str, elements: Vec<ExecutionElement>) -> JobDefinition {
    JobDefinition {
        id: id.to_string(),
        restartable: true,
        properties: Properties::new(),
        listeners: Vec::new(),
        elements,
    }
}

pub(crate) fn batchlet_step(id: &str, batchlet: ArtifactRef) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        next: None,
        start_limit: 0,
        allow_start_if_complete: false,
        properties: Properties::new(),
        listeners: Vec::new(),
        body: StepBody::Batchlet(batchlet),
        partition: None,
        transitions: Vec::new(),
    }
}

/// Chunk step over the `numbers` reader and `collect` writer.
pub(crate) fn chunk_step(id: &str, reader: ArtifactRef, item_count: u32) -> StepDefinition {
    StepDefinition {
        body: StepBody::Chunk(ChunkDefinition {
            reader,
            processor: None,
            writer: ArtifactRef::new("collect"),
            checkpoint_policy: CheckpointPolicy::Item,
            item_count: Some(item_count),
            time_limit_secs: None,
            skip_limit: None,
            skippable: ErrorClassifier::default(),
        }),
        ..batchlet_step(id, ArtifactRef::new("unused"))
    }
}

pub(crate) fn numbers(count: usize) -> ArtifactRef {
    ArtifactRef::new("numbers").with_property("count", count.to_string())
}

pub(crate) fn script(exit: &str) -> ArtifactRef {
    ArtifactRef::new("script").with_property("exit", exit)
}

pub(crate) fn failing_script() -> ArtifactRef {
    ArtifactRef::new("script").with_property("fail", "true")
}

pub(crate) fn panicking_script() -> ArtifactRef {
    ArtifactRef::new("script").with_property("panic", "true")
}

pub(crate) fn step(definition: StepDefinition) -> ExecutionElement {
    ExecutionElement::Step(definition)
}

pub(crate) fn written_numbers(probes: &Probes) -> Vec<u64> {
    probes
        .written
        .lock()
        .iter()
        .filter_map(Value::as_u64)
        .collect()
}
