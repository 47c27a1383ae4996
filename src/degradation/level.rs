//! Service levels and the signals that move between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Global service level, ordered from healthiest to most degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Full,
    Degraded,
    Minimal,
    Maintenance,
}

impl DegradationLevel {
    /// 0 for `Full` up to 3 for `Maintenance`.
    pub fn severity(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Degraded => 1,
            Self::Minimal => 2,
            Self::Maintenance => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Degraded => "degraded",
            Self::Minimal => "minimal",
            Self::Maintenance => "maintenance",
        }
    }

    /// One step more degraded; saturates at `Maintenance`.
    pub fn worse(self) -> Self {
        match self {
            Self::Full => Self::Degraded,
            Self::Degraded => Self::Minimal,
            Self::Minimal | Self::Maintenance => Self::Maintenance,
        }
    }

    /// One step healthier; saturates at `Full`.
    pub fn better(self) -> Self {
        match self {
            Self::Full | Self::Degraded => Self::Full,
            Self::Minimal => Self::Degraded,
            Self::Maintenance => Self::Minimal,
        }
    }
}

impl Default for DegradationLevel {
    fn default() -> Self {
        Self::Full
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DegradationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "degraded" => Ok(Self::Degraded),
            "minimal" => Ok(Self::Minimal),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(format!("unknown degradation level '{}'", other)),
        }
    }
}

/// Overload signal emitted by the backpressure coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Degrade,
    Restore,
}
