//! Infrastructure layer for batchflow.
//!
//! Contains implementations of the ports defined in `batchflow-core`:
//! SQLite-backed persistence, the YAML directory job loader, and loading of
//! `batchflow.toml` engine configuration.

pub mod config;
pub mod loader;
pub mod sqlite;

pub use config::load_engine_config;
pub use loader::YamlDirectoryLoader;
pub use sqlite::{DatabasePool, SqlitePersistence};
