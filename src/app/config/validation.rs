use super::{Config, ConfigError};

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.max_batch_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "Max batch bytes must be greater than 0".to_string(),
            ));
        }

        if self.batch_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "Batch timeout must be greater than 0".to_string(),
            ));
        }

        if !(self.max_memory_percent > 0.0 && self.max_memory_percent <= 100.0) {
            return Err(ConfigError::InvalidConfig(format!(
                "Max memory percent must be in (0, 100], got {}",
                self.max_memory_percent
            )));
        }

        if self.memory_limit_mb == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "Memory limit must be greater than 0 MB when set".to_string(),
            ));
        }

        for (name, value) in [
            ("Monitor interval", self.monitor_interval_ms),
            ("Cleanup interval", self.cleanup_interval_ms),
            ("GC interval", self.gc_interval_ms),
            ("Metrics interval", self.metrics_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        for (name, value) in [
            ("Snapshot history", self.snapshot_history),
            ("Metrics history", self.metrics_history),
            ("Summary window", self.summary_window),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.load_critical_ratio) {
            return Err(ConfigError::InvalidConfig(format!(
                "Load critical ratio must be in [0, 1], got {}",
                self.load_critical_ratio
            )));
        }

        Ok(())
    }
}
