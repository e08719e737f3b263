//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - quarry.toml (default configuration)
//! - quarry.local.toml (git-ignored local overrides)
//! - Environment variables (QUARRY_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # quarry.toml
//! [sorter]
//! max_pma_bytes = 4194304
//! worker_threads = 3
//!
//! [compiler]
//! file_format = 4
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! QUARRY_SORTER__MAX_PMA_BYTES=1048576
//! QUARRY_SORTER__WORKER_THREADS=0
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sorter: SorterConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// External sorter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorterConfig {
    /// In-memory bytes accumulated before a spill to disk.
    /// 0 forces a spill on every write (useful for testing).
    #[serde(default = "default_max_pma_bytes")]
    pub max_pma_bytes: usize,

    /// Below this byte count a spill only happens when the memory
    /// budget reports pressure.
    #[serde(default = "default_min_pma_bytes")]
    pub min_pma_bytes: usize,

    /// Unit of buffered file I/O for spill files
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Background threads for spill and merge work.
    /// 0 = fully single-threaded. `usize::MAX` is clamped to the CPU count.
    #[serde(default)]
    pub worker_threads: usize,

    /// Accumulate records in a single growing buffer instead of one
    /// allocation per record
    #[serde(default)]
    pub bulk_arena: bool,

    /// Optional cap on sorter heap usage in bytes (None = unlimited)
    #[serde(default)]
    pub memory_limit: Option<usize>,
}

/// Expression compiler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// On-disk file format generation. Comparison opcodes are
    /// affinity-biased from generation 4 onward.
    #[serde(default = "default_file_format")]
    pub file_format: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_max_pma_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_min_pma_bytes() -> usize {
    256 * 1024
}
fn default_page_size() -> usize {
    4096
}
fn default_file_format() -> u32 {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. quarry.toml (base configuration)
    /// 2. quarry.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (QUARRY_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("quarry.toml"))
            .merge(Toml::file("quarry.local.toml"))
            .merge(Env::prefixed("QUARRY_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("QUARRY_").split("__"))
            .extract()
    }
}

impl Default for SorterConfig {
    fn default() -> Self {
        SorterConfig {
            max_pma_bytes: default_max_pma_bytes(),
            min_pma_bytes: default_min_pma_bytes(),
            page_size: default_page_size(),
            worker_threads: 0,
            bulk_arena: false,
            memory_limit: None,
        }
    }
}

impl SorterConfig {
    /// Worker thread count with the CPU clamp applied
    pub fn effective_workers(&self) -> usize {
        self.worker_threads.min(num_cpus::get())
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            file_format: default_file_format(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sorter.max_pma_bytes, 4 * 1024 * 1024);
        assert_eq!(config.sorter.worker_threads, 0);
        assert_eq!(config.compiler.file_format, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();

        assert!(toml_str.contains("[sorter]"));
        assert!(toml_str.contains("[compiler]"));
        assert!(toml_str.contains("[logging]"));
    }

    #[test]
    fn test_effective_workers_clamp() {
        let mut cfg = SorterConfig::default();
        cfg.worker_threads = usize::MAX;
        assert!(cfg.effective_workers() <= num_cpus::get());
    }
}
