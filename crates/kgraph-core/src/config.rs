//! Engine configuration, loaded from TOML.
//!
//! Every field is optional; missing sections fall back to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{KgError, Result};

/// Which storage backend the engine opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Non-durable maps, capped node count.
    #[default]
    Memory,
    /// Single-writer SQLite file.
    File,
    /// Pooled SQLite with an optional native vector index.
    Relational,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub query: QueryConfig,
    pub cache: CacheConfig,
    pub import: ImportConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Database file for the `file` and `relational` backends.
    pub path: PathBuf,
    pub pool_min: usize,
    pub pool_max: usize,
    pub acquire_timeout_ms: u64,
    pub call_timeout_ms: u64,
    /// Node cap for the in-memory backend.
    pub max_nodes: usize,
    pub native_vector_index: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            path: PathBuf::from(".kgraph/graph.db"),
            pool_min: 1,
            pool_max: 8,
            acquire_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
            max_nodes: 1_000_000,
            native_vector_index: false,
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub max_depth: u32,
    /// Must match the embedding provider.
    pub vector_dimension: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_depth: 5,
            vector_dimension: 1536,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Entries kept before the oldest are evicted.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub batch_size: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub slow_query_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { slow_query_ms: 500 }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Serialization`] for malformed TOML and
    /// [`KgError::Validation`] for out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| KgError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Io`] if the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Reject unusable values and warn about risky ones.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Validation`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.storage.pool_min == 0 || self.storage.pool_max == 0 {
            return Err(KgError::validation("storage.pool_max", "pool sizes must be at least 1"));
        }
        if self.storage.pool_min > self.storage.pool_max {
            return Err(KgError::validation(
                "storage.pool_min",
                format!(
                    "pool_min ({}) exceeds pool_max ({})",
                    self.storage.pool_min, self.storage.pool_max
                ),
            ));
        }
        if self.storage.max_nodes == 0 {
            return Err(KgError::validation("storage.max_nodes", "must be at least 1"));
        }
        if self.query.vector_dimension == 0 {
            return Err(KgError::validation("query.vector_dimension", "must be at least 1"));
        }
        if self.query.max_depth == 0 {
            return Err(KgError::validation("query.max_depth", "must be at least 1"));
        }
        if self.query.default_limit == 0 {
            return Err(KgError::validation("query.default_limit", "must be at least 1"));
        }
        if self.import.batch_size == 0 {
            return Err(KgError::validation("import.batch_size", "must be at least 1"));
        }
        if self.cache.max_entries == 0 {
            return Err(KgError::validation("cache.max_entries", "must be at least 1"));
        }

        if self.query.max_depth > 10 {
            warn!(
                max_depth = self.query.max_depth,
                "max traversal depth above 10 can expand most of the graph"
            );
        }
        if !(100..=500).contains(&self.import.batch_size) {
            warn!(
                batch_size = self.import.batch_size,
                "import batch size outside the recommended 100-500 range"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.query.default_limit, 10);
        assert_eq!(config.query.max_depth, 5);
        assert_eq!(config.query.vector_dimension, 1536);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.cache.max_entries, 10_000);
        assert_eq!(config.storage.backend, BackendKind::Memory);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [storage]
            backend = "relational"
            pool_max = 4

            [cache]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.backend, BackendKind::Relational);
        assert_eq!(config.storage.pool_max, 4);
        assert_eq!(config.storage.pool_min, 1);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[test]
    fn rejects_inverted_pool_bounds() {
        let err = EngineConfig::from_toml_str("[storage]\npool_min = 9\npool_max = 2\n").unwrap_err();
        assert!(err.to_string().contains("pool_min"));
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(EngineConfig::from_toml_str("[storage]\nbackend = \"oracle\"\n").is_err());
    }

    #[test]
    fn deep_traversal_limit_is_allowed() {
        let config = EngineConfig::from_toml_str("[query]\nmax_depth = 12\n").unwrap();
        assert_eq!(config.query.max_depth, 12);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kgraph.toml");
        std::fs::write(&path, "[import]\nbatch_size = 250\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.import.batch_size, 250);
    }
}
