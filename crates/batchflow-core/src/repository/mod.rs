//! Persistence port and its in-memory implementation.
//!
//! The trait defines the storage interface that the infrastructure layer
//! (batchflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod persistence;

pub use memory::InMemoryPersistence;
pub use persistence::PersistenceService;
