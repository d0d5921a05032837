//! Shared domain types for batchflow.
//!
//! Statuses, persisted execution records, the resolved job model, engine
//! configuration, events and the error types shared by every layer.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod model;
pub mod status;
