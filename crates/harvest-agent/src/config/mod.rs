// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration Module
//!
//! Configuration is assembled from ordered sources; later sources override earlier ones:
//!
//! 1. **Defaults** - `Config::default()`
//! 2. **YAML file** - `harvest.yaml` in the config directory (if present)
//! 3. **Environment variables** - `HARVEST_*` (highest priority)
//!
//! Durations are given in whole seconds (`*_secs`) or milliseconds (`*_ms`) in both
//! YAML and environment sources. A source that fails to parse is logged and skipped;
//! the remaining sources still apply.

pub mod env;
pub mod log_level;
pub mod yaml;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error};

use crate::constants;
use crate::config::{env::EnvConfigSource, log_level::LogLevel, yaml::YamlConfigSource};

#[derive(Debug, PartialEq, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Unsupported config value: {0}")]
    UnsupportedField(String),
}

#[allow(clippy::module_name_repetitions)]
pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
#[allow(clippy::module_name_repetitions)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

#[allow(clippy::module_name_repetitions)]
impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            if let Err(e) = source.load(&mut self.config) {
                error!("Failed to load config: {e}");
                failed_sources += 1;
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        if self.config.checkpoint_name.trim().is_empty() {
            self.config.checkpoint_name = constants::DEFAULT_CHECKPOINT_NAME.to_string();
        }

        self.config.clone()
    }
}

/// Knobs consumed by the built-in adaptors.
#[derive(Debug, PartialEq, Clone)]
pub struct AdaptorSettings {
    /// Grace window for `Gracefully` and `Restarting` stops.
    pub graceful_timeout: Duration,
    pub file_tail_period: Duration,
    pub file_max_read_size: usize,
    pub const_rate_min_sleep_ms: u64,
    pub const_rate_sleep_variance_ms: u64,
    pub exec_default_period: Duration,
    /// Byte budget of one memory buffer.
    pub mem_buffer_size: usize,
    pub writeahead_dir: PathBuf,
    /// Reclaimable bytes that trigger a write-ahead compaction.
    pub writeahead_compact_at: u64,
    pub udp_bind_retries: u32,
    pub udp_bind_backoff: Duration,
}

impl Default for AdaptorSettings {
    fn default() -> Self {
        Self {
            graceful_timeout: constants::DEFAULT_GRACEFUL_TIMEOUT,
            file_tail_period: constants::DEFAULT_FILE_TAIL_PERIOD,
            file_max_read_size: constants::DEFAULT_FILE_MAX_READ_SIZE,
            const_rate_min_sleep_ms: constants::DEFAULT_CONST_RATE_MIN_SLEEP_MS,
            const_rate_sleep_variance_ms: constants::DEFAULT_CONST_RATE_SLEEP_VARIANCE_MS,
            exec_default_period: constants::DEFAULT_EXEC_PERIOD,
            mem_buffer_size: constants::DEFAULT_MEM_BUFFER_SIZE,
            writeahead_dir: std::env::temp_dir(),
            writeahead_compact_at: constants::DEFAULT_WRITEAHEAD_COMPACT_AT,
            udp_bind_retries: constants::DEFAULT_UDP_BIND_RETRIES,
            udp_bind_backoff: constants::DEFAULT_UDP_BIND_BACKOFF,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
#[allow(clippy::module_name_repetitions)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    pub log_level: LogLevel,
    /// Overrides hostname detection when set.
    pub hostname: Option<String>,
    /// Default `key="value"` tags stamped on every chunk.
    pub tags: String,

    // Checkpointing
    pub checkpoint_enabled: bool,
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_name: String,
    pub checkpoint_interval: Duration,
    /// File of add commands replayed once at boot, after the checkpoint.
    pub initial_adaptors: Option<PathBuf>,

    // Staging
    pub chunk_queue_limit: usize,
    pub collect_max_bytes: usize,

    // Watchdog
    pub watchdog_enabled: bool,
    pub watchdog_timeout: Duration,

    // Control listener
    pub control_enabled: bool,
    pub control_host: String,
    /// `0` asks the OS for an ephemeral port.
    pub control_port: u16,

    /// Directory the daemon's file sink writes to.
    pub output_dir: Option<PathBuf>,

    pub adaptors: AdaptorSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            hostname: None,
            tags: constants::DEFAULT_TAGS.to_string(),

            checkpoint_enabled: true,
            checkpoint_dir: None,
            checkpoint_name: constants::DEFAULT_CHECKPOINT_NAME.to_string(),
            checkpoint_interval: constants::DEFAULT_CHECKPOINT_INTERVAL,
            initial_adaptors: None,

            chunk_queue_limit: constants::DEFAULT_QUEUE_LIMIT,
            collect_max_bytes: constants::DEFAULT_COLLECT_MAX_BYTES,

            watchdog_enabled: true,
            watchdog_timeout: constants::DEFAULT_WATCHDOG_TIMEOUT,

            control_enabled: true,
            control_host: constants::DEFAULT_CONTROL_HOST.to_string(),
            control_port: constants::DEFAULT_CONTROL_PORT,

            output_dir: None,

            adaptors: AdaptorSettings::default(),
        }
    }
}

impl Config {
    /// Rejects settings the agent cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedField` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_queue_limit == 0 {
            return Err(ConfigError::UnsupportedField(
                "chunk_queue_limit must be greater than zero".to_string(),
            ));
        }
        if self.collect_max_bytes == 0 {
            return Err(ConfigError::UnsupportedField(
                "collect_max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.watchdog_timeout.is_zero() {
            return Err(ConfigError::UnsupportedField(
                "watchdog_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(ConfigError::UnsupportedField(
                "checkpoint_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.checkpoint_name.trim().is_empty() {
            return Err(ConfigError::UnsupportedField(
                "checkpoint_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory checkpoints are read from and written to, when enabled.
    #[must_use]
    pub fn checkpoint_location(&self) -> Option<&Path> {
        if self.checkpoint_enabled {
            self.checkpoint_dir.as_deref()
        } else {
            None
        }
    }
}

/// Flat view of every overridable setting, shared by the YAML and environment
/// sources. Every field is optional so absent keys keep the earlier value.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub(crate) struct PartialConfig {
    pub log_level: Option<LogLevel>,
    pub hostname: Option<String>,
    pub tags: Option<String>,

    pub checkpoint_enabled: Option<bool>,
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_name: Option<String>,
    pub checkpoint_interval_ms: Option<u64>,
    pub initial_adaptors: Option<PathBuf>,

    pub chunk_queue_limit: Option<usize>,
    pub collect_max_bytes: Option<usize>,

    pub watchdog_enabled: Option<bool>,
    pub watchdog_timeout_secs: Option<u64>,

    pub control_enabled: Option<bool>,
    pub control_host: Option<String>,
    pub control_port: Option<u16>,

    pub output_dir: Option<PathBuf>,

    pub graceful_shutdown_timeout_secs: Option<u64>,
    pub file_tail_period_ms: Option<u64>,
    pub file_max_read_size: Option<usize>,
    pub const_rate_min_sleep_ms: Option<u64>,
    pub const_rate_sleep_variance_ms: Option<u64>,
    pub exec_default_period_secs: Option<u64>,
    pub mem_buffer_size: Option<usize>,
    pub writeahead_dir: Option<PathBuf>,
    pub writeahead_compact_at: Option<u64>,
    pub udp_bind_retries: Option<u32>,
    pub udp_bind_backoff_ms: Option<u64>,
}

/// Copies `Some` values from a source onto the config.
macro_rules! merge_option_to_value {
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Copies a numeric `Some` value onto a `Duration` field.
macro_rules! merge_duration {
    ($target:expr, $value:expr, $unit:path) => {
        if let Some(value) = $value {
            $target = $unit(value);
        }
    };
}

impl PartialConfig {
    pub(crate) fn merge_into(&self, config: &mut Config) {
        merge_option_to_value!(config, self, log_level);
        merge_option_to_value!(config, self, tags);
        merge_option_to_value!(config, self, checkpoint_enabled);
        merge_option_to_value!(config, self, checkpoint_name);
        merge_option_to_value!(config, self, chunk_queue_limit);
        merge_option_to_value!(config, self, collect_max_bytes);
        merge_option_to_value!(config, self, watchdog_enabled);
        merge_option_to_value!(config, self, control_enabled);
        merge_option_to_value!(config, self, control_host);
        merge_option_to_value!(config, self, control_port);

        if self.hostname.is_some() {
            config.hostname.clone_from(&self.hostname);
        }
        if self.checkpoint_dir.is_some() {
            config.checkpoint_dir.clone_from(&self.checkpoint_dir);
        }
        if self.initial_adaptors.is_some() {
            config.initial_adaptors.clone_from(&self.initial_adaptors);
        }
        if self.output_dir.is_some() {
            config.output_dir.clone_from(&self.output_dir);
        }

        merge_duration!(config.checkpoint_interval, self.checkpoint_interval_ms, Duration::from_millis);
        merge_duration!(config.watchdog_timeout, self.watchdog_timeout_secs, Duration::from_secs);

        let adaptors = &mut config.adaptors;
        merge_option_to_value!(adaptors, self, file_max_read_size);
        merge_option_to_value!(adaptors, self, const_rate_min_sleep_ms);
        merge_option_to_value!(adaptors, self, const_rate_sleep_variance_ms);
        merge_option_to_value!(adaptors, self, mem_buffer_size);
        merge_option_to_value!(adaptors, self, writeahead_dir);
        merge_option_to_value!(adaptors, self, writeahead_compact_at);
        merge_option_to_value!(adaptors, self, udp_bind_retries);
        merge_duration!(adaptors.graceful_timeout, self.graceful_shutdown_timeout_secs, Duration::from_secs);
        merge_duration!(adaptors.file_tail_period, self.file_tail_period_ms, Duration::from_millis);
        merge_duration!(adaptors.exec_default_period, self.exec_default_period_secs, Duration::from_secs);
        merge_duration!(adaptors.udp_bind_backoff, self.udp_bind_backoff_ms, Duration::from_millis);
    }
}

#[must_use]
pub fn get_config(config_directory: &Path) -> Config {
    let path: PathBuf = config_directory.join("harvest.yaml");
    ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource { path }))
        .add_source(Box::new(EnvConfigSource))
        .build()
}
