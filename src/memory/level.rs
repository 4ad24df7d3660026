use serde::{Deserialize, Serialize};
use std::fmt;

/// Fractions of the configured ceiling at which each level starts.
pub const MODERATE_FRACTION: f64 = 0.75;
pub const HIGH_FRACTION: f64 = 0.90;
pub const CRITICAL_FRACTION: f64 = 1.0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    #[default]
    Normal,
    Moderate,
    High,
    Critical,
}

impl PressureLevel {
    /// Classifies `percent` of memory in use against a `ceiling` percentage.
    ///
    /// Breakpoints are inclusive: exactly at the ceiling is already critical.
    pub fn classify(percent: f64, ceiling: f64) -> Self {
        if !percent.is_finite() || ceiling <= 0.0 {
            return PressureLevel::Normal;
        }

        let ratio = percent / ceiling;
        if ratio >= CRITICAL_FRACTION {
            PressureLevel::Critical
        } else if ratio >= HIGH_FRACTION {
            PressureLevel::High
        } else if ratio >= MODERATE_FRACTION {
            PressureLevel::Moderate
        } else {
            PressureLevel::Normal
        }
    }

    /// Levels that trigger mitigation callbacks.
    pub fn is_elevated(self) -> bool {
        self >= PressureLevel::High
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PressureLevel::Normal => "normal",
            PressureLevel::Moderate => "moderate",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
