//! Engine configuration
//!
//! Loaded from TOML; every key is optional.
//!
//! ```toml
//! database = "ecommerce"
//! strict_division = false
//! profiling_level = "slow"
//! slow_ms = 100
//! parallel_lookup_threshold = 256
//! shard_count = 3
//! retention_years = 5
//! ```

use crate::error::{Result, StoreLensError};
use crate::profiler::ProfilingLevel;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Database used by the default session
    pub database: String,
    /// Fail pipelines on division by zero instead of yielding null
    pub strict_division: bool,
    pub profiling_level: ProfilingLevel,
    /// Operations at or above this duration are logged as slow
    pub slow_ms: u64,
    /// `$lookup` input size from which lookups run on worker threads (0 disables)
    pub parallel_lookup_threshold: usize,
    pub shard_count: u32,
    /// Age after which terminal, undelivered orders are purged
    pub retention_years: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database: "ecommerce".to_string(),
            strict_division: false,
            profiling_level: ProfilingLevel::SlowOnly,
            slow_ms: 100,
            parallel_lookup_threshold: 256,
            shard_count: 3,
            retention_years: 5,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| StoreLensError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(StoreLensError::Config(
                "database name must not be empty".to_string(),
            ));
        }
        if self.database.contains('.') {
            return Err(StoreLensError::Config(format!(
                "database name '{}' must not contain '.'",
                self.database
            )));
        }
        if self.shard_count == 0 {
            return Err(StoreLensError::Config(
                "shard_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
