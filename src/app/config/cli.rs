use super::groups::LoadConfig;
use super::serde_helpers::{load_env_enum, load_env_path_opt, load_env_var, load_env_var_opt};
use super::{ConfigError, LogFormat, LogLevel};
use crate::batcher::BatchConfig;
use crate::coordinator::CoordinatorConfig;
use crate::memory::MonitorConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Messages per destination buffer before it is flushed
    #[arg(long, env = "BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// Estimated payload bytes per destination buffer before it is flushed
    #[arg(long, env = "MAX_BATCH_BYTES", default_value = "65536")]
    pub max_batch_bytes: usize,

    /// Maximum time a message waits in a buffer, in milliseconds
    #[arg(long, env = "BATCH_TIMEOUT_MS", default_value = "50")]
    pub batch_timeout_ms: u64,

    /// Memory ceiling in percent of the memory limit
    #[arg(long, env = "MAX_MEMORY_PERCENT", default_value = "80")]
    pub max_memory_percent: f64,

    /// Memory budget in MB (total system memory when unset)
    #[arg(long, env = "MEMORY_LIMIT_MB")]
    pub memory_limit_mb: Option<u64>,

    /// Memory sampling interval in milliseconds
    #[arg(long, env = "MONITOR_INTERVAL_MS", default_value = "5000")]
    pub monitor_interval_ms: u64,

    /// Pressure cleanup interval in milliseconds
    #[arg(long, env = "CLEANUP_INTERVAL_MS", default_value = "30000")]
    pub cleanup_interval_ms: u64,

    /// Reclamation pass interval in milliseconds
    #[arg(long, env = "GC_INTERVAL_MS", default_value = "60000")]
    pub gc_interval_ms: u64,

    /// Memory samples kept in history
    #[arg(long, env = "SNAPSHOT_HISTORY", default_value = "720")]
    pub snapshot_history: usize,

    /// Metrics collection interval in seconds
    #[arg(long, env = "METRICS_INTERVAL_SECS", default_value = "60")]
    pub metrics_interval_secs: u64,

    /// Metrics entries kept in history
    #[arg(long, env = "METRICS_HISTORY", default_value = "1440")]
    pub metrics_history: usize,

    /// Metrics entries covered by a summary
    #[arg(long, env = "SUMMARY_WINDOW", default_value = "60")]
    pub summary_window: usize,

    /// Reject messages for destinations the pool does not know
    #[arg(long, env = "REJECT_UNKNOWN_DESTINATIONS")]
    pub reject_unknown_destinations: bool,

    /// Simulated destinations
    #[arg(long, env = "LOAD_DESTINATIONS", default_value = "100")]
    pub load_destinations: usize,

    /// Simulated events per second across all destinations
    #[arg(long, env = "LOAD_EVENTS_PER_SECOND", default_value = "1000")]
    pub load_events_per_second: u64,

    /// Share of simulated events sent as critical
    #[arg(long, env = "LOAD_CRITICAL_RATIO", default_value = "0.01")]
    pub load_critical_ratio: f64,

    /// Approximate size of each simulated payload in bytes
    #[arg(long, env = "LOAD_PAYLOAD_BYTES", default_value = "256")]
    pub load_payload_bytes: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "compact")]
    pub log_format: LogFormat,

    /// Configuration file path (optional)
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived groups (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub batch: BatchConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub monitor: MonitorConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub coordinator: CoordinatorConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub load: LoadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batch_bytes: 64 * 1024,
            batch_timeout_ms: 50,
            max_memory_percent: 80.0,
            memory_limit_mb: None,
            monitor_interval_ms: 5000,
            cleanup_interval_ms: 30_000,
            gc_interval_ms: 60_000,
            snapshot_history: 720,
            metrics_interval_secs: 60,
            metrics_history: 1440,
            summary_window: 60,
            reject_unknown_destinations: false,
            load_destinations: 100,
            load_events_per_second: 1000,
            load_critical_ratio: 0.01,
            load_payload_bytes: 256,
            log_level: LogLevel::Info,
            log_format: LogFormat::Compact,
            config_file: None,
            batch: BatchConfig::default(),
            monitor: MonitorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            load: LoadConfig::default(),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CONFIG_FILE") {
            Ok(path) => Self::read_file(&path)?,
            Err(_) => Config::default(),
        };

        load_env_var("BATCH_SIZE", &mut config.batch_size)?;
        load_env_var("MAX_BATCH_BYTES", &mut config.max_batch_bytes)?;
        load_env_var("BATCH_TIMEOUT_MS", &mut config.batch_timeout_ms)?;
        load_env_var("MAX_MEMORY_PERCENT", &mut config.max_memory_percent)?;
        load_env_var_opt("MEMORY_LIMIT_MB", &mut config.memory_limit_mb)?;
        load_env_var("MONITOR_INTERVAL_MS", &mut config.monitor_interval_ms)?;
        load_env_var("CLEANUP_INTERVAL_MS", &mut config.cleanup_interval_ms)?;
        load_env_var("GC_INTERVAL_MS", &mut config.gc_interval_ms)?;
        load_env_var("SNAPSHOT_HISTORY", &mut config.snapshot_history)?;
        load_env_var("METRICS_INTERVAL_SECS", &mut config.metrics_interval_secs)?;
        load_env_var("METRICS_HISTORY", &mut config.metrics_history)?;
        load_env_var("SUMMARY_WINDOW", &mut config.summary_window)?;
        load_env_var(
            "REJECT_UNKNOWN_DESTINATIONS",
            &mut config.reject_unknown_destinations,
        )?;
        load_env_var("LOAD_DESTINATIONS", &mut config.load_destinations)?;
        load_env_var("LOAD_EVENTS_PER_SECOND", &mut config.load_events_per_second)?;
        load_env_var("LOAD_CRITICAL_RATIO", &mut config.load_critical_ratio)?;
        load_env_var("LOAD_PAYLOAD_BYTES", &mut config.load_payload_bytes)?;
        load_env_enum("LOG_LEVEL", &mut config.log_level)?;
        load_env_enum("LOG_FORMAT", &mut config.log_format)?;
        load_env_path_opt("CONFIG_FILE", &mut config.config_file);

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// CLI arguments (and their environment variables) take precedence; a
    /// configuration file fills in whatever was left at its default.
    pub fn from_args_and_env<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);

        if let Some(path) = config.config_file.clone() {
            let base = Self::read_file(&path)?;
            config.merge_defaults_from(&base);
        }

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    fn read_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn merge_defaults_from(&mut self, base: &Config) {
        let defaults = Config::default();

        macro_rules! merge {
            ($($field:ident),+ $(,)?) => {
                $(
                    if self.$field == defaults.$field && base.$field != defaults.$field {
                        self.$field = base.$field.clone();
                    }
                )+
            };
        }

        merge!(
            batch_size,
            max_batch_bytes,
            batch_timeout_ms,
            max_memory_percent,
            memory_limit_mb,
            monitor_interval_ms,
            cleanup_interval_ms,
            gc_interval_ms,
            snapshot_history,
            metrics_interval_secs,
            metrics_history,
            summary_window,
            reject_unknown_destinations,
            load_destinations,
            load_events_per_second,
            load_critical_ratio,
            load_payload_bytes,
            log_level,
            log_format,
        );
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.batch = BatchConfig {
            batch_size: self.batch_size,
            max_batch_bytes: self.max_batch_bytes,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
        };

        let memory_limit_bytes = match self.memory_limit_mb {
            Some(mb) => Some(mb.checked_mul(BYTES_PER_MB).ok_or_else(|| {
                ConfigError::InvalidConfig(format!("Memory limit of {mb} MB overflows"))
            })?),
            None => None,
        };
        self.monitor = MonitorConfig {
            max_memory_percent: self.max_memory_percent,
            memory_limit_bytes,
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
            gc_interval: Duration::from_millis(self.gc_interval_ms),
            snapshot_history: self.snapshot_history,
        };

        self.coordinator = CoordinatorConfig {
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
            metrics_history: self.metrics_history,
            summary_window: self.summary_window,
            reject_unknown_destinations: self.reject_unknown_destinations,
        };

        self.load = LoadConfig {
            destinations: self.load_destinations,
            events_per_second: self.load_events_per_second,
            critical_ratio: self.load_critical_ratio,
            payload_bytes: self.load_payload_bytes,
        };

        Ok(())
    }
}
