//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with field defaults so every
//! section is optional. The core only ever sees this resolved snapshot;
//! UI-facing fields (`restore_last_session`, `show_preflight_summary`) are
//! still parsed here so the CLI has one place to read them from, but the
//! engine itself never branches on them.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Apply the cache/VCS/hidden exclusion set during manifest building.
    #[serde(default = "default_true")]
    pub exclude_cache_files: bool,

    /// Prune leading-dot entries during enumeration (unless the extension
    /// identifies a supported image type).
    #[serde(default = "default_true")]
    pub skip_hidden_files: bool,

    /// Allowed lowercase extensions; empty means "include all supported".
    #[serde(default)]
    pub file_type_filter: HashSet<String>,

    /// UI concern: whether to recall the previous source/destinations on
    /// startup. The core only ever receives already-resolved paths.
    #[serde(default)]
    pub restore_last_session: bool,

    /// UI concern: whether to show a pre-flight summary before starting.
    #[serde(default)]
    pub show_preflight_summary: bool,

    /// Minimum level surfaced to the event sink / UI.
    #[serde(default = "default_log_level")]
    pub minimum_log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level for the `tracing` subscriber (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output target (stdout, file).
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exclude_cache_files: true,
            skip_hidden_files: true,
            file_type_filter: HashSet::new(),
            restore_last_session: false,
            show_preflight_summary: true,
            minimum_log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_excludes_hidden_and_cache_files() {
        let config = Config::default();
        assert!(config.engine.exclude_cache_files);
        assert!(config.engine.skip_hidden_files);
        assert!(config.engine.file_type_filter.is_empty());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [engine]
            file_type_filter = ["nef", "jpg"]
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!(config.engine.exclude_cache_files);
        assert_eq!(config.engine.file_type_filter.len(), 2);
        assert!(config.engine.file_type_filter.contains("nef"));
    }

    #[test]
    fn parses_empty_toml_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.log.level, "info");
    }
}
