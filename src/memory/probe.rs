use super::sample::MemoryReading;
use parking_lot::Mutex;
use sysinfo::{Pid, System};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("Process {pid} not found")]
    ProcessNotFound { pid: u32 },

    #[error("Memory limit unavailable: {reason}")]
    LimitUnavailable { reason: String },

    #[error("Memory probe failed: {0}")]
    Probe(String),
}

/// Source of process memory figures.
///
/// Implementations must be cheap enough to call on every monitor tick.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> Result<MemoryReading, SampleError>;
}

/// Reads the current process' memory through `sysinfo`.
///
/// The percentage is taken against `limit_bytes` when set (container or
/// cgroup budgets), otherwise against total system memory.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Pid,
    raw_pid: u32,
    limit_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
            raw_pid: std::process::id(),
            limit_bytes,
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn read(&self) -> Result<MemoryReading, SampleError> {
        let mut system = self.system.lock();

        if !system.refresh_process(self.pid) {
            return Err(SampleError::ProcessNotFound {
                pid: self.raw_pid,
            });
        }
        let process = system
            .process(self.pid)
            .ok_or(SampleError::ProcessNotFound {
                pid: self.raw_pid,
            })?;
        let resident_bytes = process.memory();
        let virtual_bytes = process.virtual_memory();

        let limit = match self.limit_bytes {
            Some(limit) => limit,
            None => {
                system.refresh_memory();
                system.total_memory()
            }
        };
        if limit == 0 {
            return Err(SampleError::LimitUnavailable {
                reason: "memory limit reported as zero".to_string(),
            });
        }

        Ok(MemoryReading {
            resident_bytes,
            virtual_bytes,
            percent_of_limit: resident_bytes as f64 / limit as f64 * 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_own_process() {
        let probe = SystemMemoryProbe::default();
        let reading = probe.read().unwrap();
        assert!(reading.resident_bytes > 0);
        assert!(reading.percent_of_limit > 0.0);
        assert!(reading.percent_of_limit <= 100.0);
    }

    #[test]
    fn test_explicit_limit_scales_percentage() {
        let probe = SystemMemoryProbe::new(Some(1));
        let reading = probe.read().unwrap();
        assert!(reading.percent_of_limit >= 100.0);
    }

    #[test]
    fn test_zero_limit_is_an_error() {
        let probe = SystemMemoryProbe::new(Some(0));
        assert!(matches!(
            probe.read(),
            Err(SampleError::LimitUnavailable { .. })
        ));
    }
}
