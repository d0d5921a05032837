//! Explicitly constructed service graph handed to the kernel and controllers.

use std::sync::Arc;
use std::time::Duration;

use batchflow_types::config::EngineConfig;

use super::callback::JobEndCallbacks;
use super::loader::JobLoader;
use super::pool::{BatchThreadPool, TokioThreadPool};
use super::security::{ConfiguredSecurity, SecurityService};
use crate::artifact::ArtifactFactory;
use crate::error::BatchError;
use crate::event::EventBus;
use crate::repository::PersistenceService;

/// Every collaborator the engine needs.
pub struct ServiceContext {
    pub config: EngineConfig,
    pub persistence: Arc<dyn PersistenceService>,
    pub pool: Arc<dyn BatchThreadPool>,
    pub artifacts: Arc<dyn ArtifactFactory>,
    pub loader: Arc<dyn JobLoader>,
    pub security: Arc<dyn SecurityService>,
    pub callbacks: JobEndCallbacks,
    pub events: EventBus,
}

impl ServiceContext {
    /// Build with the tokio pool of the current runtime and the configured
    /// security identity.
    pub fn new(
        config: EngineConfig,
        persistence: Arc<dyn PersistenceService>,
        artifacts: Arc<dyn ArtifactFactory>,
        loader: Arc<dyn JobLoader>,
    ) -> Result<Self, BatchError> {
        let pool = TokioThreadPool::from_current(config.thread_pool.max_concurrent_tasks)
            .map_err(|e| BatchError::InternalConsistency(format!("no tokio runtime: {e}")))?;
        let security = ConfiguredSecurity::new(&config.security);
        Ok(Self {
            callbacks: JobEndCallbacks::new(Duration::from_millis(config.callback.wait_timeout_ms)),
            events: EventBus::new(config.event_bus_capacity),
            pool: Arc::new(pool),
            security: Arc::new(security),
            config,
            persistence,
            artifacts,
            loader,
        })
    }

    pub fn with_pool(mut self, pool: Arc<dyn BatchThreadPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_security(mut self, security: Arc<dyn SecurityService>) -> Self {
        self.security = security;
        self
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
