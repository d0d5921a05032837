//! SQLite storage layer.
//!
//! The batch persistence port backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod persistence;
pub mod pool;

pub use persistence::SqlitePersistence;
pub use pool::{DatabasePool, default_database_url};
