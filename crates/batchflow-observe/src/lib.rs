//! Observability for batchflow: tracing subscriber setup driven by the
//! `[logging]` section of `batchflow.toml`.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
