//! Batch job execution engine.
//!
//! This crate holds the engine and the ports it needs (persistence, artifact
//! factory, job loader, thread pool, security). It depends only on
//! `batchflow-types` -- never on `batchflow-infra` or any database/IO crate.

pub mod artifact;
pub mod engine;
pub mod error;
pub mod event;
pub mod repository;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::JobOperator;
pub use error::BatchError;
