use super::level::PressureLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw figures reported by a [`MemoryProbe`](super::probe::MemoryProbe).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    /// Resident memory as a percentage of the applicable limit.
    pub percent_of_limit: f64,
}

/// One classified point-in-time observation of process memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub percent_of_limit: f64,
    pub pressure_level: PressureLevel,
}

impl MemorySample {
    pub fn from_reading(reading: MemoryReading, ceiling: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            resident_bytes: reading.resident_bytes,
            virtual_bytes: reading.virtual_bytes,
            percent_of_limit: reading.percent_of_limit,
            pressure_level: PressureLevel::classify(reading.percent_of_limit, ceiling),
        }
    }

    /// Sample used when process memory cannot be read.
    pub fn unavailable() -> Self {
        Self {
            timestamp: Utc::now(),
            resident_bytes: 0,
            virtual_bytes: 0,
            percent_of_limit: 0.0,
            pressure_level: PressureLevel::Normal,
        }
    }

    pub fn resident_mb(&self) -> f64 {
        self.resident_bytes as f64 / (1024.0 * 1024.0)
    }
}
