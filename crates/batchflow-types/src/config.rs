//! Engine configuration types.
//!
//! `EngineConfig` represents the `batchflow.toml` file that tunes the thread
//! pool, chunk defaults, partition hand-off, security tags and logging. Every
//! field has a default so an empty file (or no file) yields a working engine.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,

    #[serde(default)]
    pub chunk: ChunkConfig,

    #[serde(default)]
    pub partition: PartitionConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub callback: CallbackConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Capacity of the broadcast channel behind the event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thread_pool: ThreadPoolConfig::default(),
            chunk: ChunkConfig::default(),
            partition: PartitionConfig::default(),
            security: SecurityConfig::default(),
            callback: CallbackConfig::default(),
            logging: LoggingConfig::default(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

/// Work-unit scheduling limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// Maximum concurrently running work units; unbounded when absent.
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
}

/// Defaults applied to chunk steps that leave the values unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_item_count")]
    pub default_item_count: u32,

    /// 0 disables the time-based checkpoint.
    #[serde(default)]
    pub default_time_limit_secs: u32,
}

fn default_item_count() -> u32 {
    10
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            default_item_count: default_item_count(),
            default_time_limit_secs: 0,
        }
    }
}

/// Partition hand-off tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Capacity of the partition-to-coordinator queue; defaults to the
    /// number of partitions.
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Longest wait for the next partition message before the step fails.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

fn default_wait_timeout_secs() -> u64 {
    3600
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

/// Tag-based authorization settings for the default security service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_tag")]
    pub current_tag: String,

    /// Tags allowed to see and operate on every instance.
    #[serde(default)]
    pub admin_tags: Vec<String>,
}

fn default_tag() -> String {
    "default".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            current_tag: default_tag(),
            admin_tags: Vec::new(),
        }
    }
}

/// Job-end callback polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Interval at which waiters re-check persisted status.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_wait_timeout_ms() -> u64 {
    500
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set.
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,

    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
            otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk.default_item_count, 10);
        assert_eq!(config.chunk.default_time_limit_secs, 0);
        assert_eq!(config.partition.wait_timeout_secs, 3600);
        assert_eq!(config.security.current_tag, "default");
        assert_eq!(config.callback.wait_timeout_ms, 500);
        assert_eq!(config.event_bus_capacity, 1024);
        assert!(config.thread_pool.max_concurrent_tasks.is_none());
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
event_bus_capacity = 64

[thread_pool]
max_concurrent_tasks = 8

[chunk]
default_item_count = 50

[partition]
wait_timeout_secs = 30

[security]
current_tag = "tenant-a"
admin_tags = ["ops"]

[logging]
filter = "batchflow=debug"
json = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.event_bus_capacity, 64);
        assert_eq!(config.thread_pool.max_concurrent_tasks, Some(8));
        assert_eq!(config.chunk.default_item_count, 50);
        assert_eq!(config.chunk.default_time_limit_secs, 0);
        assert_eq!(config.partition.wait_timeout_secs, 30);
        assert_eq!(config.security.current_tag, "tenant-a");
        assert_eq!(config.security.admin_tags, vec!["ops".to_string()]);
        assert!(config.logging.json);
        assert!(!config.logging.otel);
    }

    #[test]
    fn test_engine_config_serde_roundtrip() {
        let mut config = EngineConfig::default();
        config.partition.queue_capacity = Some(4);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
