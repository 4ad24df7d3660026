use serde::{Deserialize, Serialize};

/// Synthetic traffic driven by the `push-fanout` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub destinations: usize,
    pub events_per_second: u64,
    /// Share of events sent as critical, in `[0, 1]`.
    pub critical_ratio: f64,
    pub payload_bytes: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            destinations: 100,
            events_per_second: 1000,
            critical_ratio: 0.01,
            payload_bytes: 256,
        }
    }
}
