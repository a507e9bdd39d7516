use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::aggregation::schema::{ColumnAliases, default_column_aliases};
use crate::error::RunError;

pub const DEFAULT_CHUNK_SIZE: usize = 100_000;
pub const DEFAULT_SKETCH_SIZE: usize = 100;
const SKETCH_SIZE_RANGE: std::ops::RangeInclusive<usize> = 10..=10_000;

/// Tunables consumed by the aggregation engine.
///
/// Stored as a JSON object on disk; every key is optional:
/// ```json
/// {
///   "chunk_size": 100000,
///   "sketch_size": 100,
///   "concurrency": 4,
///   "file_timeout_secs": 900,
///   "column_aliases": {
///     "pickup_time": ["lpep_pickup_datetime", "pickup_datetime"]
///   }
/// }
/// ```
/// A `column_aliases` object replaces the built-in alias table as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Records per chunk. Affects memory and throughput, never results.
    pub chunk_size: usize,
    /// Maximum centroids per quantile sketch.
    pub sketch_size: usize,
    /// Source files read in parallel.
    pub concurrency: usize,
    pub file_timeout_secs: u64,
    pub column_aliases: ColumnAliases,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            sketch_size: DEFAULT_SKETCH_SIZE,
            concurrency: 4,
            file_timeout_secs: 900,
            column_aliases: default_column_aliases(),
        }
    }
}

impl EngineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config '{path}'"))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing engine config '{path}'"))?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with. Called before any file
    /// is opened.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.chunk_size == 0 {
            return Err(RunError::FatalConfig("chunk_size must be at least 1".into()));
        }
        if !SKETCH_SIZE_RANGE.contains(&self.sketch_size) {
            return Err(RunError::FatalConfig(format!(
                "sketch_size must be within {}..={}, got {}",
                SKETCH_SIZE_RANGE.start(),
                SKETCH_SIZE_RANGE.end(),
                self.sketch_size
            )));
        }
        if self.concurrency == 0 {
            return Err(RunError::FatalConfig("concurrency must be at least 1".into()));
        }
        if self.file_timeout_secs == 0 {
            return Err(RunError::FatalConfig(
                "file_timeout_secs must be at least 1".into(),
            ));
        }
        for (field, names) in &self.column_aliases {
            if names.iter().any(|n| n.trim().is_empty()) {
                return Err(RunError::FatalConfig(format!(
                    "column_aliases for `{field}` contains an empty name"
                )));
            }
        }
        Ok(())
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }
}
