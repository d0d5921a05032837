//! Artifact factory and the name-indexed registry implementing it.

use std::sync::Arc;

use batchflow_types::error::ArtifactError;
use batchflow_types::model::ArtifactRef;
use dashmap::DashMap;

use super::{
    Batchlet, CheckpointAlgorithm, Decider, ItemProcessor, ItemReader, ItemWriter, JobListener,
    PartitionAnalyzer, PartitionCollector, PartitionMapper, PartitionReducer, StepListener,
};
use crate::engine::context::InjectionContext;
use crate::error::BatchError;

/// Builds artifacts from their reference names.
///
/// The context passed in carries job/step state; implementations receive the
/// reference's own properties merged in via [`InjectionContext::with_properties`].
pub trait ArtifactFactory: Send + Sync {
    fn create_reader(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn ItemReader>, BatchError>;

    fn create_processor(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn ItemProcessor>, BatchError>;

    fn create_writer(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn ItemWriter>, BatchError>;

    fn create_checkpoint_algorithm(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn CheckpointAlgorithm>, BatchError>;

    fn create_batchlet(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn Batchlet>, BatchError>;

    fn create_partition_mapper(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionMapper>, BatchError>;

    fn create_partition_reducer(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionReducer>, BatchError>;

    fn create_partition_collector(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionCollector>, BatchError>;

    fn create_partition_analyzer(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionAnalyzer>, BatchError>;

    fn create_decider(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn Decider>, BatchError>;

    fn create_step_listener(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn StepListener>, BatchError>;

    fn create_job_listener(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn JobListener>, BatchError>;
}

// ---------------------------------------------------------------------------
// ArtifactRegistry
// ---------------------------------------------------------------------------

type Constructor<T> =
    Arc<dyn Fn(&InjectionContext) -> Result<Box<T>, ArtifactError> + Send + Sync>;

struct Constructors<T: ?Sized> {
    kind: &'static str,
    by_name: DashMap<String, Constructor<T>>,
}

impl<T: ?Sized> Constructors<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            by_name: DashMap::new(),
        }
    }

    fn insert(&self, name: String, constructor: Constructor<T>) {
        self.by_name.insert(name, constructor);
    }

    fn build(&self, artifact: &ArtifactRef, ctx: &InjectionContext) -> Result<Box<T>, BatchError> {
        // Clone the constructor out so no map guard is held while user code runs.
        let constructor = self
            .by_name
            .get(&artifact.name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BatchError::ArtifactNotFound {
                kind: self.kind,
                name: artifact.name.clone(),
            })?;
        tracing::trace!(kind = self.kind, artifact = %artifact.name, "building artifact");
        Ok(constructor(&ctx.with_properties(&artifact.properties))?)
    }
}

/// Name-indexed registry of artifact constructors, one namespace per kind.
///
/// Registering a name twice replaces the previous constructor.
pub struct ArtifactRegistry {
    readers: Constructors<dyn ItemReader>,
    processors: Constructors<dyn ItemProcessor>,
    writers: Constructors<dyn ItemWriter>,
    checkpoint_algorithms: Constructors<dyn CheckpointAlgorithm>,
    batchlets: Constructors<dyn Batchlet>,
    mappers: Constructors<dyn PartitionMapper>,
    reducers: Constructors<dyn PartitionReducer>,
    collectors: Constructors<dyn PartitionCollector>,
    analyzers: Constructors<dyn PartitionAnalyzer>,
    deciders: Constructors<dyn Decider>,
    step_listeners: Constructors<dyn StepListener>,
    job_listeners: Constructors<dyn JobListener>,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        Self {
            readers: Constructors::new("reader"),
            processors: Constructors::new("processor"),
            writers: Constructors::new("writer"),
            checkpoint_algorithms: Constructors::new("checkpoint algorithm"),
            batchlets: Constructors::new("batchlet"),
            mappers: Constructors::new("partition mapper"),
            reducers: Constructors::new("partition reducer"),
            collectors: Constructors::new("partition collector"),
            analyzers: Constructors::new("partition analyzer"),
            deciders: Constructors::new("decider"),
            step_listeners: Constructors::new("step listener"),
            job_listeners: Constructors::new("job listener"),
        }
    }

    pub fn register_reader<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn ItemReader>, ArtifactError> + Send + Sync + 'static,
    {
        self.readers.insert(name.into(), Arc::new(f));
    }

    pub fn register_processor<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn ItemProcessor>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.processors.insert(name.into(), Arc::new(f));
    }

    pub fn register_writer<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn ItemWriter>, ArtifactError> + Send + Sync + 'static,
    {
        self.writers.insert(name.into(), Arc::new(f));
    }

    pub fn register_checkpoint_algorithm<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn CheckpointAlgorithm>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.checkpoint_algorithms.insert(name.into(), Arc::new(f));
    }

    pub fn register_batchlet<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn Batchlet>, ArtifactError> + Send + Sync + 'static,
    {
        self.batchlets.insert(name.into(), Arc::new(f));
    }

    pub fn register_partition_mapper<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn PartitionMapper>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.mappers.insert(name.into(), Arc::new(f));
    }

    pub fn register_partition_reducer<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn PartitionReducer>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.reducers.insert(name.into(), Arc::new(f));
    }

    pub fn register_partition_collector<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn PartitionCollector>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.collectors.insert(name.into(), Arc::new(f));
    }

    pub fn register_partition_analyzer<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn PartitionAnalyzer>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.analyzers.insert(name.into(), Arc::new(f));
    }

    pub fn register_decider<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn Decider>, ArtifactError> + Send + Sync + 'static,
    {
        self.deciders.insert(name.into(), Arc::new(f));
    }

    pub fn register_step_listener<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn StepListener>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.step_listeners.insert(name.into(), Arc::new(f));
    }

    pub fn register_job_listener<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&InjectionContext) -> Result<Box<dyn JobListener>, ArtifactError>
            + Send
            + Sync
            + 'static,
    {
        self.job_listeners.insert(name.into(), Arc::new(f));
    }
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactFactory for ArtifactRegistry {
    fn create_reader(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn ItemReader>, BatchError> {
        self.readers.build(artifact, ctx)
    }

    fn create_processor(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn ItemProcessor>, BatchError> {
        self.processors.build(artifact, ctx)
    }

    fn create_writer(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn ItemWriter>, BatchError> {
        self.writers.build(artifact, ctx)
    }

    fn create_checkpoint_algorithm(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn CheckpointAlgorithm>, BatchError> {
        self.checkpoint_algorithms.build(artifact, ctx)
    }

    fn create_batchlet(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn Batchlet>, BatchError> {
        self.batchlets.build(artifact, ctx)
    }

    fn create_partition_mapper(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionMapper>, BatchError> {
        self.mappers.build(artifact, ctx)
    }

    fn create_partition_reducer(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionReducer>, BatchError> {
        self.reducers.build(artifact, ctx)
    }

    fn create_partition_collector(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionCollector>, BatchError> {
        self.collectors.build(artifact, ctx)
    }

    fn create_partition_analyzer(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn PartitionAnalyzer>, BatchError> {
        self.analyzers.build(artifact, ctx)
    }

    fn create_decider(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn Decider>, BatchError> {
        self.deciders.build(artifact, ctx)
    }

    fn create_step_listener(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn StepListener>, BatchError> {
        self.step_listeners.build(artifact, ctx)
    }

    fn create_job_listener(
        &self,
        artifact: &ArtifactRef,
        ctx: &InjectionContext,
    ) -> Result<Box<dyn JobListener>, BatchError> {
        self.job_listeners.build(artifact, ctx)
    }
}
