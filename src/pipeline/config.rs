//! Pipeline configuration from environment variables

use std::env;

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Path to SQLite database file (catalog + submission history)
    pub db_path: String,

    /// Directory holding the `*.sql` schema files
    pub schema_dir: String,

    /// Channel buffer size for score ingestion (updates)
    pub channel_buffer: usize,

    /// Worker tasks; each owns a disjoint set of members
    pub workers: usize,

    /// Eager retention pass interval in milliseconds
    pub retention_interval_ms: u64,

    /// `reconcile_all` interval in milliseconds
    pub reconcile_interval_ms: u64,

    /// JSONL file change events are appended to
    pub events_path: String,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `RANKFLOW_DB_PATH` (default: /var/lib/rankflow/rankflow.db)
    /// - `RANKFLOW_SCHEMA_DIR` (default: sql)
    /// - `RANKFLOW_CHANNEL_BUFFER` (default: 10000)
    /// - `RANKFLOW_WORKERS` (default: 4)
    /// - `RANKFLOW_RETENTION_INTERVAL_MS` (default: 60000)
    /// - `RANKFLOW_RECONCILE_INTERVAL_MS` (default: 300000)
    /// - `RANKFLOW_EVENTS_PATH` (default: streams/rank_events.jsonl)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            db_path: lookup("RANKFLOW_DB_PATH")
                .unwrap_or_else(|| "/var/lib/rankflow/rankflow.db".to_string()),

            schema_dir: lookup("RANKFLOW_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),

            channel_buffer: lookup("RANKFLOW_CHANNEL_BUFFER")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(10_000),

            workers: lookup("RANKFLOW_WORKERS")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),

            retention_interval_ms: lookup("RANKFLOW_RETENTION_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(60_000),

            reconcile_interval_ms: lookup("RANKFLOW_RECONCILE_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(300_000),

            events_path: lookup("RANKFLOW_EVENTS_PATH")
                .unwrap_or_else(|| "streams/rank_events.jsonl".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[]));

        assert_eq!(config.db_path, "/var/lib/rankflow/rankflow.db");
        assert_eq!(config.schema_dir, "sql");
        assert_eq!(config.channel_buffer, 10_000);
        assert_eq!(config.workers, 4);
        assert_eq!(config.retention_interval_ms, 60_000);
        assert_eq!(config.reconcile_interval_ms, 300_000);
    }

    #[test]
    fn test_custom_config() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("RANKFLOW_DB_PATH", "/tmp/test.db"),
            ("RANKFLOW_CHANNEL_BUFFER", "5000"),
            ("RANKFLOW_WORKERS", "0"),
            ("RANKFLOW_RECONCILE_INTERVAL_MS", "2000"),
        ]));

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.channel_buffer, 5_000);
        // Zero workers would stall ingestion.
        assert_eq!(config.workers, 4);
        assert_eq!(config.reconcile_interval_ms, 2_000);
    }
}
