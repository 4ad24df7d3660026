//! Process memory pressure monitoring.
//!
//! The monitor runs three independent periodic loops: sampling (records
//! history and level transitions), cleanup (runs pressure callbacks when the
//! level is high or critical) and reclamation (runs registered reclaimers
//! regardless of pressure).

pub mod level;
pub mod monitor;
pub mod probe;
pub mod sample;

pub use level::PressureLevel;
pub use monitor::{
    CallbackError, MemoryPressureMonitor, MonitorStats, MonitorStatistics, SnapshotStats,
};
pub use probe::{MemoryProbe, SampleError, SystemMemoryProbe};
pub use sample::{MemoryReading, MemorySample};

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Ceiling, in percent of the memory limit, at which pressure is critical.
    pub max_memory_percent: f64,
    /// Explicit memory budget; total system memory when unset.
    pub memory_limit_bytes: Option<u64>,
    #[serde(rename = "monitor_interval_ms", with = "crate::app::config::serde_helpers")]
    pub monitor_interval: Duration,
    #[serde(rename = "cleanup_interval_ms", with = "crate::app::config::serde_helpers")]
    pub cleanup_interval: Duration,
    #[serde(rename = "gc_interval_ms", with = "crate::app::config::serde_helpers")]
    pub gc_interval: Duration,
    /// Number of samples kept in the history ring.
    pub snapshot_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_memory_percent: 80.0,
            memory_limit_bytes: None,
            monitor_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            gc_interval: Duration::from_secs(60),
            snapshot_history: 720,
        }
    }
}
